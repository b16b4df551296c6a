//! Ride lifecycle states and the legal transition table.
//!
//! ```text
//!   queued ──► open ──► claimed ──► completed
//!     │         │  ▲       │
//!     │         │  └─undo──┘
//!     ▼         ▼          ▼
//!   canceled  canceled  canceled
//! ```
//!
//! `completed` and `canceled` are terminal. The `claimed → open` edge is not
//! part of the generic table: it is only reachable through the claim
//! coordinator's undo path, which carries its own ownership guard.
//!
//! Upstream data sources disagree on casing and vocabulary (`"Open"`,
//! `"cancelled"`, `"unclaimed"`), so raw tokens are parsed into [`RideState`]
//! once, at the store boundary, and every legality check afterwards works on
//! the enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a raw state token is not a known ride state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown ride state: {0:?}")]
pub struct ParseStateError(pub String);

/// Lifecycle state of a ride.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideState {
    /// Waiting in the queue, not yet released into the live pool.
    Queued,
    /// Live and claimable.
    Open,
    /// Claimed by exactly one driver.
    Claimed,
    /// Finished (terminal).
    Completed,
    /// Canceled (terminal).
    Canceled,
}

impl RideState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Open,
        Self::Claimed,
        Self::Completed,
        Self::Canceled,
    ];

    /// Canonical lowercase token, as written to the `state`/`status` fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Open => "open",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// States reachable from `self` through the generic transition protocol.
    #[must_use]
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::Queued => &[Self::Open, Self::Canceled],
            Self::Open => &[Self::Claimed, Self::Canceled],
            Self::Claimed => &[Self::Completed, Self::Canceled],
            Self::Completed | Self::Canceled => &[],
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }

    /// Parse a raw token from an upstream record.
    ///
    /// Case and surrounding whitespace are ignored, and the legacy spellings
    /// used by older writers are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ParseStateError`] for an empty or unknown token.
    pub fn parse_token(raw: &str) -> Result<Self, ParseStateError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "queue" => Ok(Self::Queued),
            "open" | "unclaimed" | "available" => Ok(Self::Open),
            "claimed" => Ok(Self::Claimed),
            "completed" | "complete" => Ok(Self::Completed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(ParseStateError(raw.to_string())),
        }
    }
}

impl fmt::Display for RideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_token(s)
    }
}

/// Whether `from → to` is an edge of the transition table.
///
/// Pure lookup; same-state pairs are never legal.
///
/// ```
/// use ride_dispatch_core::state::{is_legal, RideState};
///
/// assert!(is_legal(RideState::Queued, RideState::Open));
/// assert!(!is_legal(RideState::Queued, RideState::Completed));
/// assert!(!is_legal(RideState::Open, RideState::Open));
/// ```
#[must_use]
pub fn is_legal(from: RideState, to: RideState) -> bool {
    from.successors().contains(&to)
}
