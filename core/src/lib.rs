//! # Ride Dispatch Core
//!
//! Pure building blocks of the ride dispatch engine.
//!
//! This crate holds everything that can be decided without I/O:
//!
//! - **State model** ([`state`]): ride lifecycle states and the legal transition table
//! - **Ride schema** ([`ride`]): the canonical record and the single normalization
//!   step that resolves upstream field aliases
//! - **Storage contract** ([`document`]): revisioned documents and atomic,
//!   precondition-guarded write batches
//! - **Errors** ([`error`]): the dispatch error taxonomy
//! - **Eligibility** ([`gate`]): the nightly blackout window with admin override
//! - **Environment** ([`environment`]): injected dependencies such as the clock
//!
//! The transactional protocol that ties these together lives in
//! `ride-dispatch-runtime`.
//!
//! ## Example
//!
//! ```
//! use ride_dispatch_core::state::{is_legal, RideState};
//!
//! let from: RideState = "Open".parse().unwrap();
//! assert!(is_legal(from, RideState::Claimed));
//! assert!(!is_legal(from, RideState::Completed));
//! ```

pub mod document;
pub mod error;
pub mod gate;
pub mod ids;
pub mod ride;
pub mod state;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use document::{
    Collection, CollectionNames, Document, DocumentKey, DocumentStore, StoreError, WriteBatch,
};
pub use error::{DispatchError, Result};
pub use ids::{DriverId, Revision, RideId};
pub use ride::Ride;
pub use state::{is_legal, RideState};

/// Environment module - injected dependencies
///
/// External effects the engine needs (currently only time) are abstracted
/// behind traits so tests can substitute deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
