//! # Ride Dispatch Runtime
//!
//! The transactional side of the ride dispatch engine.
//!
//! Every lifecycle change runs as one optimistic transaction against a
//! [`DocumentStore`](ride_dispatch_core::DocumentStore): the canonical ride and
//! both shadow indexes commit together or not at all, and conflicting
//! transactions are re-run from scratch under a bounded retry policy.
//!
//! ## Core Components
//!
//! - **Adapter** ([`RideStoreAdapter`]): guarded state transitions with queue
//!   fallback and shadow maintenance
//! - **Claim Coordinator** ([`ClaimCoordinator`]): claim, undo, complete and
//!   cancel with driver ownership checks
//! - **Batch Orchestrator** ([`BatchClaimOrchestrator`]): multi-ride claims that
//!   stop only at the eligibility gate
//! - **Eligibility Gate** ([`EligibilityGate`]): the blackout window in the
//!   office's time zone
//! - **Maintenance** ([`ShadowMaintenance`]): shadow rebuild and queue release
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch_runtime::{ClaimCoordinator, ClaimOptions, RideStoreAdapter};
//! use ride_dispatch_core::{DriverId, RideId};
//!
//! let adapter = Arc::new(RideStoreAdapter::new(store, clock));
//! let coordinator = ClaimCoordinator::new(adapter);
//!
//! let ride = coordinator
//!     .claim(&RideId::new("R-100"), &DriverId::new("driver-7"), ClaimOptions::default())
//!     .await?;
//! assert_eq!(ride.state, RideState::Claimed);
//! ```

/// Guarded ride transitions over a document store
pub mod adapter;

/// Multi-ride claims and the known-state cache
pub mod batch;

/// Environment-driven configuration
pub mod config;

/// Claim, undo, complete and cancel
pub mod coordinator;

/// Blackout window bound to a clock and time zone
pub mod gate;

/// Shadow rebuild and queue release jobs
pub mod maintenance;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Shadow index planning and writes
pub mod shadow;

/// Read-pinning write buffer for one transaction attempt
pub mod unit_of_work;

pub use adapter::{ExtraFields, RideStoreAdapter, SYSTEM_ACTOR, TransitionOptions};
pub use batch::{BatchClaimOrchestrator, BatchClaimOutcome, KnownRide, KnownRides};
pub use config::DispatchConfig;
pub use coordinator::{ClaimCoordinator, ClaimOptions, DEFAULT_CANCEL_REASON};
pub use gate::EligibilityGate;
pub use maintenance::{QueueReleaseReport, RebuildReport, ShadowMaintenance};
pub use retry::{RetryPolicy, run_transaction};
pub use shadow::{ShadowIndexMaintainer, ShadowPlan, ShadowWrite};
pub use unit_of_work::UnitOfWork;
