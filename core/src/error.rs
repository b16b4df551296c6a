//! Error taxonomy for ride transitions and claims.

use crate::document::StoreError;
use crate::ids::{DriverId, RideId};
use crate::state::RideState;
use thiserror::Error;

/// Errors returned by every dispatch operation.
///
/// An operation that returns an error has had no effect: the atomic unit it
/// ran in was discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// `(from, to)` is not in the transition table. Always a caller bug.
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// Requested source state.
        from: RideState,
        /// Requested target state.
        to: RideState,
    },

    /// Neither a canonical record nor a queue entry exists.
    #[error("Ride {0} not found")]
    NotFound(RideId),

    /// The ride is in a different state than the caller expected.
    #[error("State mismatch for {ride_id}: expected {expected}, found {found}")]
    StateMismatch {
        /// Ride that moved.
        ride_id: RideId,
        /// State the caller expected.
        expected: RideState,
        /// State actually stored.
        found: RideState,
    },

    /// A claim was attempted on a ride that is not `open`.
    #[error("Ride {ride_id} is not open (state: {state})")]
    NotOpen {
        /// Ride that could not be claimed.
        ride_id: RideId,
        /// Its current state.
        state: RideState,
    },

    /// Another driver holds the claim.
    #[error("Ride {ride_id} already claimed by another driver")]
    AlreadyClaimed {
        /// Ride that could not be claimed.
        ride_id: RideId,
        /// Driver currently holding it.
        claimed_by: DriverId,
    },

    /// Undo attempted by someone who does not hold the claim.
    #[error("Cannot undo: ride {ride_id} is not claimed by {driver_id}")]
    NotClaimedByYou {
        /// Ride the undo targeted.
        ride_id: RideId,
        /// Driver that attempted the undo.
        driver_id: DriverId,
    },

    /// The eligibility gate is closed for this caller.
    #[error("Claiming is closed during the blackout window")]
    ClaimingClosed,

    /// Concurrent writers kept invalidating the read snapshot until the retry
    /// budget ran out.
    #[error("Write conflict persisted after {attempts} attempts: {detail}")]
    Conflict {
        /// Attempts made, including the first.
        attempts: usize,
        /// Last conflict reported by the store.
        detail: String,
    },

    /// Transport or connectivity failure after the store's retries.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be normalized into a ride.
    #[error("Malformed record {ride_id}: {reason}")]
    MalformedRecord {
        /// Record that failed to normalize.
        ride_id: RideId,
        /// What was wrong with it.
        reason: String,
    },

    /// The request itself is inconsistent (for example, a claim without claimant).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Non-transient storage failure (serialization, backend bug).
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    /// Whether re-running the whole operation may succeed.
    ///
    /// Only store-level conflicts and unavailability qualify. Domain outcomes
    /// (`NotFound`, `StateMismatch`, claim guards) reflect committed state and
    /// would fail identically on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::StoreUnavailable(_))
    }

    /// Short message suitable for showing to a dispatcher.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "Ride no longer exists.",
            Self::StateMismatch { .. } => "Ride changed, please refresh.",
            Self::NotOpen { .. } => "Ride is no longer available.",
            Self::AlreadyClaimed { .. } => "Ride already claimed by another driver.",
            Self::NotClaimedByYou { .. } => "Cannot undo: not claimed by you.",
            Self::ClaimingClosed => "Ride claims are locked right now.",
            Self::Conflict { .. } | Self::StoreUnavailable(_) => {
                "Temporary problem saving the ride, please try again."
            }
            Self::InvalidTransition { .. }
            | Self::MalformedRecord { .. }
            | Self::InvalidRequest(_)
            | Self::Storage(_) => "Unexpected error, please contact an administrator.",
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => Self::Conflict {
                attempts: 1,
                detail: err.to_string(),
            },
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Serialization(msg) | StoreError::Backend(msg) => Self::Storage(msg),
        }
    }
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
