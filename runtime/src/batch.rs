//! Batch Claim Orchestrator and the known-ride cache it validates against.
//!
//! A dispatcher selects rides from a list that may already be stale. Before
//! each claim the orchestrator re-checks the id against [`KnownRides`], the
//! latest state this session has seen, and skips ids that are no longer
//! claimable. Claims then run one at a time; a failure on one ride is logged
//! and recorded but never stops the rest, and nothing already claimed is
//! rolled back.

use crate::coordinator::{ClaimCoordinator, ClaimOptions};
use crate::gate::EligibilityGate;
use crate::metrics::BatchMetrics;
use ride_dispatch_core::document::{Collection, DocumentStore};
use ride_dispatch_core::gate::Role;
use ride_dispatch_core::{DispatchError, DriverId, Result, Ride, RideId, RideState};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// What the cache remembers about a ride.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownRide {
    /// Last seen state.
    pub state: RideState,
    /// Last seen claimant.
    pub claimed_by: Option<DriverId>,
}

impl KnownRide {
    /// Open and unheld.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        self.state == RideState::Open && self.claimed_by.is_none()
    }
}

impl From<&Ride> for KnownRide {
    fn from(ride: &Ride) -> Self {
        Self {
            state: ride.state,
            claimed_by: ride.claimed_by.clone(),
        }
    }
}

/// Read-through cache of last-known ride state for one dispatcher session.
///
/// Explicitly constructed and owned by the caller. Clones share the same
/// entries.
#[derive(Clone, Debug, Default)]
pub struct KnownRides {
    entries: Arc<RwLock<HashMap<RideId, KnownRide>>>,
}

impl KnownRides {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the current Open Shadow.
    ///
    /// Shadow entries that cannot be normalized are skipped with a warning.
    /// Returns the number of rides loaded.
    ///
    /// # Errors
    ///
    /// Propagates the store's read error; the cache is left unchanged.
    pub async fn refresh(&self, store: &dyn DocumentStore) -> Result<usize> {
        let docs = store.list(Collection::LiveRides).await?;
        let mut fresh = HashMap::with_capacity(docs.len());
        for doc in docs {
            match Ride::from_document(&doc.id, &doc.body, Some(RideState::Open)) {
                Ok(ride) => {
                    fresh.insert(RideId::new(doc.id), KnownRide::from(&ride));
                }
                Err(error) => tracing::warn!(%error, "Skipping unreadable open shadow entry"),
            }
        }
        let loaded = fresh.len();
        *self.write_entries() = fresh;
        tracing::debug!(loaded, "Known rides refreshed");
        Ok(loaded)
    }

    // Every write replaces whole entries, so a poisoned map is still usable.
    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<RideId, KnownRide>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<RideId, KnownRide>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the latest state of `ride`.
    pub fn observe(&self, ride: &Ride) {
        self.observe_state(&ride.id, KnownRide::from(ride));
    }

    fn observe_state(&self, ride_id: &RideId, known: KnownRide) {
        self.write_entries().insert(ride_id.clone(), known);
    }

    /// Forget `ride_id`; it is no longer considered claimable.
    pub fn invalidate(&self, ride_id: &RideId) {
        self.write_entries().remove(ride_id);
    }

    /// Last known state of `ride_id`.
    #[must_use]
    pub fn get(&self, ride_id: &RideId) -> Option<KnownRide> {
        self.read_entries().get(ride_id).cloned()
    }

    /// Whether `ride_id` was last seen open and unheld. Unknown rides are not.
    #[must_use]
    pub fn is_claimable(&self, ride_id: &RideId) -> bool {
        self.get(ride_id).is_some_and(|known| known.is_claimable())
    }

    /// Number of rides known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    /// Whether nothing is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aggregate result of [`BatchClaimOrchestrator::claim_many`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchClaimOutcome {
    /// Claims that succeeded.
    pub succeeded: usize,
    /// Claims attempted (selected ids that were still claimable).
    pub attempted: usize,
    /// Rides claimed, in order.
    pub claimed: Vec<RideId>,
    /// Ids skipped as stale before any store access.
    pub skipped: Vec<RideId>,
    /// Ids whose claim failed, with the reason.
    pub failures: Vec<(RideId, DispatchError)>,
}

impl BatchClaimOutcome {
    /// Whether every attempted claim succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.attempted
    }
}

/// Claims a selection of rides one after another.
#[derive(Clone, Debug)]
pub struct BatchClaimOrchestrator {
    coordinator: ClaimCoordinator,
    gate: EligibilityGate,
}

impl BatchClaimOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub const fn new(coordinator: ClaimCoordinator, gate: EligibilityGate) -> Self {
        Self { coordinator, gate }
    }

    /// The gate consulted once per batch.
    #[must_use]
    pub const fn gate(&self) -> &EligibilityGate {
        &self.gate
    }

    /// Claim every still-claimable id in `selected` for `driver_id`.
    ///
    /// Duplicate ids are claimed once. `known` is re-checked immediately
    /// before each claim and updated with each outcome.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ClaimingClosed`] if the gate is closed for `role`; the
    /// store is not touched. Per-ride failures are reported in the outcome.
    #[tracing::instrument(skip_all, fields(driver_id = %driver_id, selected = selected.len()))]
    pub async fn claim_many(
        &self,
        selected: &[RideId],
        driver_id: &DriverId,
        role: &Role,
        known: &KnownRides,
        options: ClaimOptions,
    ) -> Result<BatchClaimOutcome> {
        if let Err(error) = self.gate.ensure_open(role) {
            BatchMetrics::record_rejected();
            tracing::warn!(%role, "Batch claim rejected: claiming is closed");
            return Err(error);
        }

        let mut outcome = BatchClaimOutcome::default();
        let mut seen = HashSet::new();

        for ride_id in selected {
            if !seen.insert(ride_id) {
                continue;
            }
            if !known.is_claimable(ride_id) {
                tracing::debug!(ride_id = %ride_id, "Skipping stale selection");
                outcome.skipped.push(ride_id.clone());
                continue;
            }

            outcome.attempted += 1;
            match self
                .coordinator
                .claim(ride_id, driver_id, options.clone())
                .await
            {
                Ok(ride) => {
                    known.observe_state(ride_id, KnownRide::from(&ride));
                    outcome.succeeded += 1;
                    outcome.claimed.push(ride_id.clone());
                }
                Err(error) => {
                    tracing::warn!(ride_id = %ride_id, %error, "Claim failed, continuing batch");
                    remember_failure(known, ride_id, &error);
                    outcome.failures.push((ride_id.clone(), error));
                }
            }
        }

        BatchMetrics::record_completed(
            outcome.succeeded,
            outcome.failures.len(),
            outcome.skipped.len(),
        );
        tracing::info!(
            succeeded = outcome.succeeded,
            attempted = outcome.attempted,
            skipped = outcome.skipped.len(),
            "Batch claim finished"
        );
        Ok(outcome)
    }
}

/// Update the cache with what a failed claim revealed.
fn remember_failure(known: &KnownRides, ride_id: &RideId, error: &DispatchError) {
    match error {
        DispatchError::AlreadyClaimed { claimed_by, .. } => known.observe_state(
            ride_id,
            KnownRide {
                state: RideState::Claimed,
                claimed_by: Some(claimed_by.clone()),
            },
        ),
        DispatchError::NotOpen { state, .. } => known.observe_state(
            ride_id,
            KnownRide {
                state: *state,
                claimed_by: None,
            },
        ),
        DispatchError::NotFound(_) | DispatchError::MalformedRecord { .. } => {
            known.invalidate(ride_id);
        }
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::adapter::RideStoreAdapter;
    use crate::retry::RetryPolicy;
    use ride_dispatch_core::gate::BlackoutWindow;
    use ride_dispatch_testing::{InMemoryDocumentStore, fixtures, test_clock};

    fn orchestrator(store: &InMemoryDocumentStore, window: BlackoutWindow) -> BatchClaimOrchestrator {
        let clock = Arc::new(test_clock());
        let adapter = RideStoreAdapter::new(Arc::new(store.clone()), clock.clone())
            .with_retry_policy(RetryPolicy::no_retry());
        BatchClaimOrchestrator::new(
            ClaimCoordinator::new(Arc::new(adapter)),
            EligibilityGate::new(clock, window).with_timezone(chrono_tz::UTC),
        )
    }

    fn ids(raw: &[&str]) -> Vec<RideId> {
        raw.iter().map(|id| RideId::new(*id)).collect()
    }

    #[tokio::test]
    async fn refresh_loads_open_shadow() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        fixtures::seed_claimed_ride(&store, "R-2", "d-1");

        let known = KnownRides::new();
        assert_eq!(known.refresh(&store).await.unwrap(), 1);
        assert!(known.is_claimable(&RideId::new("R-1")));
        assert!(!known.is_claimable(&RideId::new("R-2")));

        known.invalidate(&RideId::new("R-1"));
        assert!(known.is_empty());
    }

    #[tokio::test]
    async fn closed_gate_rejects_before_store_access() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let known = KnownRides::new();
        known.refresh(&store).await.unwrap();
        let reads_before = store.reads();

        // test_clock() is midnight UTC.
        let orchestrator = orchestrator(&store, BlackoutWindow::new(22, 6).unwrap());
        let result = orchestrator
            .claim_many(&ids(&["R-1"]), &DriverId::new("d-1"), &Role::Driver, &known, ClaimOptions::default())
            .await;

        assert_eq!(result, Err(DispatchError::ClaimingClosed));
        assert_eq!(store.reads(), reads_before);
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn stale_and_duplicate_selections_are_skipped() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let known = KnownRides::new();
        known.refresh(&store).await.unwrap();

        let outcome = orchestrator(&store, BlackoutWindow::disabled())
            .claim_many(
                &ids(&["R-1", "R-1", "R-404"]),
                &DriverId::new("d-1"),
                &Role::Driver,
                &known,
                ClaimOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.attempted, 1);
        assert_eq!(outcome.skipped, ids(&["R-404"]));
        assert!(outcome.is_complete());
        assert!(!known.is_claimable(&RideId::new("R-1")));
    }

    #[tokio::test]
    async fn failures_update_the_cache() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let known = KnownRides::new();
        known.refresh(&store).await.unwrap();
        fixtures::seed_claimed_ride(&store, "R-1", "d-9");

        let outcome = orchestrator(&store, BlackoutWindow::disabled())
            .claim_many(&ids(&["R-1"]), &DriverId::new("d-1"), &Role::Admin, &known, ClaimOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.attempted, 1);
        assert!(matches!(outcome.failures[0].1, DispatchError::AlreadyClaimed { .. }));
        assert_eq!(
            known.get(&RideId::new("R-1")).and_then(|k| k.claimed_by),
            Some(DriverId::new("d-9"))
        );
    }

    #[tokio::test]
    async fn poisoned_cache_is_still_refreshed() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let known = KnownRides::new();
        let shared = known.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.entries.write();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(known.entries.is_poisoned());

        assert_eq!(known.refresh(&store).await.unwrap(), 1);
        assert!(known.is_claimable(&RideId::new("R-1")));
        known.invalidate(&RideId::new("R-1"));
        assert!(known.is_empty());
    }
}
