//! Ride Store Adapter: the transactional transition protocol.
//!
//! [`RideStoreAdapter::transition`] moves one ride between two states inside a
//! single [`UnitOfWork`]: it reads the canonical record (or materializes it
//! from the queue entry on the very first transition), checks the expected
//! state, writes the merged record, deletes the consumed queue entry and
//! updates both shadows. Observers see either the whole pre-transition world
//! or the whole post-transition world.
//!
//! Alias resolution happens here and nowhere else: stored documents go
//! through [`Ride::from_document`] on the way in and [`Ride::to_document`] on
//! the way out.

use crate::metrics::TransitionMetrics;
use crate::retry::{RetryPolicy, run_transaction};
use crate::shadow::ShadowIndexMaintainer;
use crate::unit_of_work::UnitOfWork;
use ride_dispatch_core::document::{Collection, Document, DocumentKey, DocumentStore};
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::ride::is_reserved_field;
use ride_dispatch_core::{DispatchError, DriverId, Result, Ride, RideId, RideState, is_legal};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Actor recorded in `updatedBy` when the caller supplies none.
pub const SYSTEM_ACTOR: &str = "system";

/// Caller-supplied fields merged into the record by a transition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtraFields {
    /// Claimant; required when transitioning into `claimed`.
    pub claimed_by: Option<DriverId>,
    /// Display name of the claimant.
    pub claimed_by_name: Option<String>,
    /// Vehicle associated with the claim.
    pub claimed_vehicle: Option<String>,
    /// Reason recorded on cancellation.
    pub cancel_reason: Option<String>,
    /// Free-form fields. Schema field names are rejected.
    pub attributes: Document,
}

/// Options for [`RideStoreAdapter::transition`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransitionOptions {
    /// Recorded as `updatedBy`; defaults to [`SYSTEM_ACTOR`].
    pub actor_id: Option<String>,
    /// Queue entry to fall back to (and consume) when leaving `queued`.
    /// Defaults to the ride id.
    pub queue_id: Option<String>,
    /// Fields merged into the record.
    pub extra: ExtraFields,
}

impl TransitionOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the acting user.
    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the queue entry id.
    #[must_use]
    pub fn queue_id(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    /// Set the claimant.
    #[must_use]
    pub fn claimed_by(mut self, driver_id: DriverId) -> Self {
        self.extra.claimed_by = Some(driver_id);
        self
    }

    /// Set the cancellation reason.
    #[must_use]
    pub fn cancel_reason(mut self, reason: impl Into<String>) -> Self {
        self.extra.cancel_reason = Some(reason.into());
        self
    }

    /// Add a free-form attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.attributes.insert(name.into(), value.into());
        self
    }

    fn actor_or_system(&self) -> &str {
        self.actor_id.as_deref().unwrap_or(SYSTEM_ACTOR)
    }
}

/// Reads and transitions rides against a [`DocumentStore`].
///
/// Cheap to share behind an `Arc`; holds no per-ride state.
pub struct RideStoreAdapter {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    shadows: ShadowIndexMaintainer,
}

impl std::fmt::Debug for RideStoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RideStoreAdapter")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RideStoreAdapter {
    /// Create an adapter with the default retry budget.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
            shadows: ShadowIndexMaintainer,
        }
    }

    /// Replace the transaction retry budget.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Current time according to the injected clock.
    #[must_use]
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Transaction retry budget.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The shadow maintainer used inside every unit of work.
    #[must_use]
    pub const fn shadows(&self) -> ShadowIndexMaintainer {
        self.shadows
    }

    /// Open a fresh unit of work.
    #[must_use]
    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork::new(self.store.as_ref())
    }

    /// Run `transaction` under the retry budget, re-running it from scratch on
    /// conflicts.
    ///
    /// # Errors
    ///
    /// Whatever the last attempt returned; see [`run_transaction`].
    pub async fn atomically<T, F, Fut>(&self, operation: &'static str, transaction: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        run_transaction(&self.retry, operation, transaction).await
    }

    /// Read and normalize a canonical ride.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] if there is no canonical record
    /// - [`DispatchError::MalformedRecord`] if it cannot be normalized
    /// - [`DispatchError::StoreUnavailable`] if the store cannot be reached
    #[tracing::instrument(skip_all, fields(ride_id = %ride_id))]
    pub async fn get_ride(&self, ride_id: &RideId) -> Result<Ride> {
        let found = self
            .store
            .get(DocumentKey::new(Collection::Rides, ride_id.as_str()))
            .await?;
        let doc = found.ok_or_else(|| DispatchError::NotFound(ride_id.clone()))?;
        Ride::from_document(ride_id.as_str(), &doc.body, None)
    }

    /// Move `ride_id` from `expected_from` to `to` atomically.
    ///
    /// If the ride is already at `to` the call succeeds without writing and
    /// returns the stored record.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidTransition`] for an illegal pair, before any store access
    /// - [`DispatchError::InvalidRequest`] for inconsistent options, before any store access
    /// - [`DispatchError::NotFound`] if neither the ride nor its queue entry exists
    /// - [`DispatchError::StateMismatch`] if the ride is in some other state
    /// - [`DispatchError::Conflict`] / [`DispatchError::StoreUnavailable`] once retries run out
    #[tracing::instrument(
        skip_all,
        fields(ride_id = %ride_id, from = %expected_from, to = %to, actor = options.actor_or_system())
    )]
    pub async fn transition(
        &self,
        ride_id: &RideId,
        expected_from: RideState,
        to: RideState,
        options: TransitionOptions,
    ) -> Result<Ride> {
        validate_request(expected_from, to, &options)?;

        let started = Instant::now();
        let result = self
            .atomically("transition", || {
                self.transition_once(ride_id, expected_from, to, &options)
            })
            .await;

        match &result {
            Ok(Applied::Written(_)) => {
                TransitionMetrics::record(expected_from, to, started.elapsed());
                tracing::info!("Ride transitioned");
            }
            Ok(Applied::AlreadyAtTarget(_)) => {
                tracing::debug!("Ride already at target state, nothing written");
            }
            Err(error) => tracing::warn!(%error, "Ride transition failed"),
        }
        result.map(Applied::into_ride)
    }

    async fn transition_once(
        &self,
        ride_id: &RideId,
        expected_from: RideState,
        to: RideState,
        options: &TransitionOptions,
    ) -> Result<Applied> {
        let queue_id = options.queue_id.clone().or_else(|| {
            (expected_from == RideState::Queued).then(|| ride_id.as_str().to_string())
        });

        let mut uow = self.begin();
        let (current, from_queue) = match uow.read(Collection::Rides, ride_id.as_str()).await? {
            Some(doc) => (Ride::from_document(ride_id.as_str(), &doc.body, None)?, false),
            None => {
                let Some(queue_id) = queue_id.as_deref() else {
                    return Err(DispatchError::NotFound(ride_id.clone()));
                };
                let queued = uow
                    .read(Collection::RideQueue, queue_id)
                    .await?
                    .ok_or_else(|| DispatchError::NotFound(ride_id.clone()))?;
                let mut ride =
                    Ride::from_document(queue_id, &queued.body, Some(RideState::Queued))?;
                ride.id = ride_id.clone();
                (ride, true)
            }
        };

        if current.state != expected_from {
            if current.state == to {
                return Ok(Applied::AlreadyAtTarget(current));
            }
            return Err(DispatchError::StateMismatch {
                ride_id: ride_id.clone(),
                expected: expected_from,
                found: current.state,
            });
        }

        let now = self.clock.now();
        let mut next = current.clone();
        next.state = to;
        next.updated_at = Some(now);
        next.updated_by = Some(options.actor_or_system().to_string());
        if let Some(queue_id) = &queue_id {
            next.queue_id = Some(queue_id.clone());
        }
        if (from_queue || to == RideState::Open) && next.created_at.is_none() {
            next.created_at = Some(now);
        }
        apply_extra(&mut next, &current, &options.extra, now);

        uow.set(Collection::Rides, ride_id.as_str(), next.to_document());
        if let Some(queue_id) = &queue_id {
            if expected_from == RideState::Queued {
                uow.delete(Collection::RideQueue, queue_id);
            }
        }
        self.shadows
            .sync(&mut uow, &current, &next, expected_from, to, now);

        uow.commit().await?;
        Ok(Applied::Written(next))
    }
}

/// Result of one transition attempt.
enum Applied {
    Written(Ride),
    AlreadyAtTarget(Ride),
}

impl Applied {
    fn into_ride(self) -> Ride {
        match self {
            Self::Written(ride) | Self::AlreadyAtTarget(ride) => ride,
        }
    }
}

fn validate_request(from: RideState, to: RideState, options: &TransitionOptions) -> Result<()> {
    if !is_legal(from, to) {
        return Err(DispatchError::InvalidTransition { from, to });
    }
    if to == RideState::Claimed && options.extra.claimed_by.is_none() {
        return Err(DispatchError::InvalidRequest(
            "a transition into claimed needs a claimant".to_string(),
        ));
    }
    if let Some(field) = options
        .extra
        .attributes
        .keys()
        .find(|name| is_reserved_field(name))
    {
        return Err(DispatchError::InvalidRequest(format!(
            "attribute `{field}` is a ride schema field"
        )));
    }
    Ok(())
}

/// Merge caller fields and keep the claim fields consistent with the new state.
fn apply_extra(next: &mut Ride, current: &Ride, extra: &ExtraFields, now: chrono::DateTime<chrono::Utc>) {
    for (name, value) in &extra.attributes {
        next.attributes.insert(name.clone(), value.clone());
    }

    if next.state == RideState::Claimed {
        next.claimed_by.clone_from(&extra.claimed_by);
        next.claimed_by_name.clone_from(&extra.claimed_by_name);
        next.claimed_vehicle.clone_from(&extra.claimed_vehicle);
        next.claimed_at = Some(now);
    } else {
        if next.state == RideState::Completed {
            next.completed_by.clone_from(&current.claimed_by);
        }
        next.clear_claim();
    }

    if let Some(reason) = &extra.cancel_reason {
        next.cancel_reason = Some(reason.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ride_dispatch_testing::{InMemoryDocumentStore, fixtures, test_clock};
    use serde_json::json;

    fn adapter(store: &InMemoryDocumentStore) -> RideStoreAdapter {
        RideStoreAdapter::new(Arc::new(store.clone()), Arc::new(test_clock()))
            .with_retry_policy(RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn illegal_pair_is_rejected_without_store_access() {
        let store = InMemoryDocumentStore::new();
        let result = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Queued,
                RideState::Completed,
                TransitionOptions::new(),
            )
            .await;

        assert_eq!(
            result,
            Err(DispatchError::InvalidTransition {
                from: RideState::Queued,
                to: RideState::Completed,
            })
        );
        assert_eq!(store.reads(), 0);
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn reserved_attribute_is_rejected() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let result = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Open,
                RideState::Canceled,
                TransitionOptions::new().attribute("status", "open"),
            )
            .await;

        assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn claim_without_claimant_is_rejected() {
        let store = InMemoryDocumentStore::new();
        let result = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Open,
                RideState::Claimed,
                TransitionOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn state_mismatch_writes_nothing() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_claimed_ride(&store, "R-1", "d-1");
        let result = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Open,
                RideState::Canceled,
                TransitionOptions::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::StateMismatch {
                expected: RideState::Open,
                found: RideState::Claimed,
                ..
            })
        ));
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn already_at_target_is_a_no_op() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let ride = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Queued,
                RideState::Open,
                TransitionOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(ride.state, RideState::Open);
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn cancel_from_claimed_clears_claim_and_shadow() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_claimed_ride(&store, "R-1", "d-1");
        let ride = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Claimed,
                RideState::Canceled,
                TransitionOptions::new().actor("dispatcher-1").cancel_reason("no-show"),
            )
            .await
            .unwrap();

        assert_eq!(ride.claimed_by, None);
        assert_eq!(ride.cancel_reason.as_deref(), Some("no-show"));
        assert!(!store.contains(Collection::ClaimedRides, "R-1"));

        let stored = store.document(Collection::Rides, "R-1").unwrap();
        assert_eq!(stored.get("state"), Some(&json!("canceled")));
        assert_eq!(stored.get("status"), Some(&json!("canceled")));
        assert_eq!(stored.get("claimedBy"), Some(&serde_json::Value::Null));
        assert_eq!(stored.get("updatedBy"), Some(&json!("dispatcher-1")));
    }

    #[tokio::test]
    async fn completion_records_former_claimant() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_claimed_ride(&store, "R-1", "d-1");
        let ride = adapter(&store)
            .transition(
                &RideId::new("R-1"),
                RideState::Claimed,
                RideState::Completed,
                TransitionOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(ride.completed_by, Some(DriverId::new("d-1")));
        assert!(ride.claim_invariant_holds());
        assert_eq!(ride.updated_by.as_deref(), Some(SYSTEM_ACTOR));
    }

    #[tokio::test]
    async fn get_ride_reports_missing_and_malformed_records() {
        let store = InMemoryDocumentStore::new();
        let adapter = adapter(&store);
        assert_eq!(
            adapter.get_ride(&RideId::new("R-9")).await,
            Err(DispatchError::NotFound(RideId::new("R-9")))
        );

        store.insert(
            Collection::Rides,
            "R-9",
            json!({"state": "lost"}).as_object().cloned().unwrap(),
        );
        assert!(matches!(
            adapter.get_ride(&RideId::new("R-9")).await,
            Err(DispatchError::MalformedRecord { .. })
        ));
    }
}
