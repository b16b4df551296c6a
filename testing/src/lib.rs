//! # Ride Dispatch Testing
//!
//! Testing utilities for the ride dispatch engine.
//!
//! This crate provides:
//! - [`InMemoryDocumentStore`]: a transactional in-memory store with fault injection
//! - [`FixedClock`]: deterministic, manually advanced time
//! - [`fixtures`]: builders for ride documents and queue entries
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch_testing::{fixtures, test_clock, InMemoryDocumentStore};
//!
//! #[tokio::test]
//! async fn claim_flow() {
//!     let store = InMemoryDocumentStore::new();
//!     fixtures::seed_open_ride(&store, "R-1");
//!     let adapter = RideStoreAdapter::new(Arc::new(store.clone()), Arc::new(test_clock()));
//!     let coordinator = ClaimCoordinator::new(Arc::new(adapter));
//!     coordinator
//!         .claim(&RideId::new("R-1"), &DriverId::new("driver-7"), ClaimOptions::default())
//!         .await
//!         .unwrap();
//!     assert!(store.contains(Collection::ClaimedRides, "R-1"));
//! }
//! ```

pub mod memory_store;

use chrono::{DateTime, Utc};
use ride_dispatch_core::environment::Clock;

pub use memory_store::{InMemoryData, InMemoryDocumentStore};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until moved with [`FixedClock::set`] or
    /// [`FixedClock::advance`]. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use ride_dispatch_testing::mocks::FixedClock;
    /// use ride_dispatch_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now() - time1, Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = time;
        }

        /// Move forward by `delta`.
        pub fn advance(&self, delta: chrono::Duration) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) += delta;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
                .read()
                .map_or_else(|poisoned| *poisoned.into_inner(), |guard| *guard)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for ride documents in the shapes upstream writers produce.
pub mod fixtures {
    use crate::InMemoryDocumentStore;
    use ride_dispatch_core::document::{Collection, Document};
    use serde_json::{json, Value};

    /// Creation timestamp used by every fixture.
    pub const CREATED_AT: &str = "2024-12-31T18:00:00.000Z";

    fn object(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    /// A canonical ride document in `state`.
    #[must_use]
    pub fn ride_document(id: &str, state: &str) -> Document {
        object(json!({
            "id": id,
            "rideId": id,
            "state": state,
            "status": state,
            "createdAt": CREATED_AT,
            "pickupAt": "2025-01-02T15:00:00.000Z",
            "passenger": format!("Passenger {id}"),
        }))
    }

    /// A canonical `claimed` ride document held by `driver`.
    #[must_use]
    pub fn claimed_ride_document(id: &str, driver: &str) -> Document {
        let mut doc = ride_document(id, "claimed");
        doc.insert("claimedBy".into(), Value::from(driver));
        doc.insert("claimedAt".into(), Value::from(CREATED_AT));
        doc
    }

    /// A legacy queue entry: no state field, aliased id.
    #[must_use]
    pub fn queue_entry(id: &str) -> Document {
        object(json!({
            "tripId": id,
            "pickupTime": "2025-01-02T15:00:00.000Z",
            "created": CREATED_AT,
            "vehicle": "Limo Bus",
        }))
    }

    /// Seed an `open` ride with its Open Shadow entry.
    pub fn seed_open_ride(store: &InMemoryDocumentStore, id: &str) {
        store.insert(Collection::Rides, id, ride_document(id, "open"));
        store.insert(Collection::LiveRides, id, ride_document(id, "open"));
    }

    /// Seed a `claimed` ride with its Claimed Shadow entry.
    pub fn seed_claimed_ride(store: &InMemoryDocumentStore, id: &str, driver: &str) {
        store.insert(Collection::Rides, id, claimed_ride_document(id, driver));
        store.insert(Collection::ClaimedRides, id, claimed_ride_document(id, driver));
    }

    /// Seed a queue entry with no canonical record.
    pub fn seed_queue_entry(store: &InMemoryDocumentStore, id: &str) {
        store.insert(Collection::RideQueue, id, queue_entry(id));
    }
}

// Re-export commonly used items
pub use mocks::{test_clock, FixedClock};
