//! Strong identifier types for rides, drivers and document revisions.
//!
//! Identifiers arrive from the identity collaborator and the dispatcher UI as
//! opaque strings. The newtypes exist so a driver id can never be passed where
//! a ride id is expected, and so document revisions used for optimistic
//! concurrency are not confused with plain integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid identifier: {0}")]
pub struct ParseIdError(String);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from trusted input (no validation).
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert into the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(ParseIdError(format!(
                        "{} cannot be empty",
                        stringify!($name)
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of a ride (the canonical record key in `rides`).
    ///
    /// # Examples
    ///
    /// ```
    /// use ride_dispatch_core::ids::RideId;
    ///
    /// let id = RideId::new("R-100");
    /// assert_eq!(id.as_str(), "R-100");
    ///
    /// let parsed: RideId = " R-100 ".parse().unwrap();
    /// assert_eq!(parsed, id);
    /// ```
    RideId
}

string_id! {
    /// Identifier of a driver, as supplied by the identity collaborator.
    DriverId
}

/// Revision of a stored document, used for optimistic concurrency control.
///
/// Every committed write gives the document a new revision strictly greater
/// than any revision the store has handed out before, so a document that is
/// deleted and recreated never reuses an old revision. A unit of work records
/// the revision it read and the commit only succeeds if the document is still
/// at that revision.
///
/// ```
/// use ride_dispatch_core::ids::Revision;
///
/// let r0 = Revision::INITIAL;
/// assert_eq!(r0.next(), Revision::new(2));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// Lowest revision a store hands out.
    pub const INITIAL: Self = Self(1);

    /// Create a revision with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw revision number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next revision in sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
