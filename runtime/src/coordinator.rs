//! Claim Coordinator: claim-once, undo, complete and cancel.
//!
//! `claim` and `undo` run their own guarded unit of work instead of the generic
//! transition: a claim must also reject a ride some other driver holds even
//! when both drivers saw it `open`, and undo is the one edge (`claimed ->
//! open`) the lifecycle table does not contain. Completion, cancellation and
//! queue release are thin wrappers over [`RideStoreAdapter::transition`].

use crate::adapter::{RideStoreAdapter, SYSTEM_ACTOR, TransitionOptions};
use crate::metrics::ClaimMetrics;
use ride_dispatch_core::document::Collection;
use ride_dispatch_core::{DispatchError, DriverId, Result, Ride, RideId, RideState};
use std::sync::Arc;

/// Reason recorded when a cancellation does not give one.
pub const DEFAULT_CANCEL_REASON: &str = "unspecified";

/// Options for [`ClaimCoordinator::claim`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimOptions {
    /// Vehicle the driver will use.
    pub vehicle_id: Option<String>,
    /// Recorded as `updatedBy`; defaults to `system`.
    pub actor_id: Option<String>,
    /// Display name for the Claimed Shadow; defaults to the driver id.
    pub driver_name: Option<String>,
}

impl ClaimOptions {
    /// Set the vehicle.
    #[must_use]
    pub fn vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    /// Set the acting user.
    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the driver's display name.
    #[must_use]
    pub fn driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = Some(name.into());
        self
    }
}

/// Enforces at most one claim per ride.
#[derive(Clone, Debug)]
pub struct ClaimCoordinator {
    adapter: Arc<RideStoreAdapter>,
}

impl ClaimCoordinator {
    /// Create a coordinator over `adapter`.
    #[must_use]
    pub const fn new(adapter: Arc<RideStoreAdapter>) -> Self {
        Self { adapter }
    }

    /// The adapter used for every transition.
    #[must_use]
    pub const fn adapter(&self) -> &Arc<RideStoreAdapter> {
        &self.adapter
    }

    /// Claim `ride_id` for `driver_id`.
    ///
    /// Re-claiming a ride the same driver already holds succeeds without
    /// writing.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] if the ride does not exist
    /// - [`DispatchError::AlreadyClaimed`] if another driver holds it
    /// - [`DispatchError::NotOpen`] if it is not `open`
    /// - [`DispatchError::Conflict`] / [`DispatchError::StoreUnavailable`] once retries run out
    #[tracing::instrument(skip_all, fields(ride_id = %ride_id, driver_id = %driver_id))]
    pub async fn claim(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
        options: ClaimOptions,
    ) -> Result<Ride> {
        let result = self
            .adapter
            .atomically("claim", || self.claim_once(ride_id, driver_id, &options))
            .await;

        ClaimMetrics::record("claim", &result);
        match &result {
            Ok(_) => tracing::info!("Ride claimed"),
            Err(error) => tracing::warn!(%error, "Claim rejected"),
        }
        result
    }

    async fn claim_once(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
        options: &ClaimOptions,
    ) -> Result<Ride> {
        let mut uow = self.adapter.begin();
        let doc = uow
            .read(Collection::Rides, ride_id.as_str())
            .await?
            .ok_or_else(|| DispatchError::NotFound(ride_id.clone()))?;
        let current = Ride::from_document(ride_id.as_str(), &doc.body, None)?;

        if let Some(holder) = &current.claimed_by {
            if holder != driver_id {
                return Err(DispatchError::AlreadyClaimed {
                    ride_id: ride_id.clone(),
                    claimed_by: holder.clone(),
                });
            }
            if current.state == RideState::Claimed {
                tracing::debug!("Ride already claimed by this driver");
                return Ok(current);
            }
        }
        if current.state != RideState::Open {
            return Err(DispatchError::NotOpen {
                ride_id: ride_id.clone(),
                state: current.state,
            });
        }

        let now = self.adapter.now();
        let mut next = current.clone();
        next.state = RideState::Claimed;
        next.claimed_by = Some(driver_id.clone());
        next.claimed_at = Some(now);
        next.claimed_vehicle.clone_from(&options.vehicle_id);
        next.claimed_by_name = Some(
            options
                .driver_name
                .clone()
                .unwrap_or_else(|| driver_id.to_string()),
        );
        next.updated_at = Some(now);
        next.updated_by = Some(
            options
                .actor_id
                .clone()
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
        );

        uow.set(Collection::Rides, ride_id.as_str(), next.to_document());
        self.adapter.shadows().sync(
            &mut uow,
            &current,
            &next,
            RideState::Open,
            RideState::Claimed,
            now,
        );
        uow.commit().await?;
        Ok(next)
    }

    /// Return a ride `driver_id` holds to `open`.
    ///
    /// The Open Shadow is recreated with the ride's original creation time.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] if the ride does not exist
    /// - [`DispatchError::NotClaimedByYou`] unless the ride is `claimed` by `driver_id`
    /// - [`DispatchError::Conflict`] / [`DispatchError::StoreUnavailable`] once retries run out
    #[tracing::instrument(skip_all, fields(ride_id = %ride_id, driver_id = %driver_id))]
    pub async fn undo(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
        actor_id: Option<&str>,
    ) -> Result<Ride> {
        let result = self
            .adapter
            .atomically("undo", || self.undo_once(ride_id, driver_id, actor_id))
            .await;

        ClaimMetrics::record("undo", &result);
        match &result {
            Ok(_) => tracing::info!("Claim undone"),
            Err(error) => tracing::warn!(%error, "Undo rejected"),
        }
        result
    }

    async fn undo_once(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
        actor_id: Option<&str>,
    ) -> Result<Ride> {
        let mut uow = self.adapter.begin();
        let doc = uow
            .read(Collection::Rides, ride_id.as_str())
            .await?
            .ok_or_else(|| DispatchError::NotFound(ride_id.clone()))?;
        let current = Ride::from_document(ride_id.as_str(), &doc.body, None)?;

        if current.state != RideState::Claimed || current.claimed_by.as_ref() != Some(driver_id) {
            return Err(DispatchError::NotClaimedByYou {
                ride_id: ride_id.clone(),
                driver_id: driver_id.clone(),
            });
        }

        let now = self.adapter.now();
        let mut next = current.clone();
        next.state = RideState::Open;
        next.clear_claim();
        if next.created_at.is_none() {
            next.created_at = Some(now);
        }
        next.updated_at = Some(now);
        next.updated_by = Some(actor_id.unwrap_or(SYSTEM_ACTOR).to_string());

        uow.set(Collection::Rides, ride_id.as_str(), next.to_document());
        self.adapter.shadows().sync(
            &mut uow,
            &current,
            &next,
            RideState::Claimed,
            RideState::Open,
            now,
        );
        uow.commit().await?;
        Ok(next)
    }

    /// Mark a claimed ride completed.
    ///
    /// # Errors
    ///
    /// See [`RideStoreAdapter::transition`].
    pub async fn complete(&self, ride_id: &RideId, actor_id: Option<&str>) -> Result<Ride> {
        self.adapter
            .transition(
                ride_id,
                RideState::Claimed,
                RideState::Completed,
                with_actor(TransitionOptions::new(), actor_id),
            )
            .await
    }

    /// Cancel a ride that is currently `from` (`queued`, `open` or `claimed`).
    ///
    /// A missing reason is recorded as [`DEFAULT_CANCEL_REASON`].
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidTransition`] if `from` is terminal; otherwise see
    /// [`RideStoreAdapter::transition`].
    pub async fn cancel(
        &self,
        ride_id: &RideId,
        from: RideState,
        reason: Option<&str>,
        actor_id: Option<&str>,
    ) -> Result<Ride> {
        let options = TransitionOptions::new()
            .cancel_reason(reason.unwrap_or(DEFAULT_CANCEL_REASON));
        self.adapter
            .transition(
                ride_id,
                from,
                RideState::Canceled,
                with_actor(options, actor_id),
            )
            .await
    }

    /// Release a queue entry into the live pool (`queued -> open`).
    ///
    /// # Errors
    ///
    /// See [`RideStoreAdapter::transition`].
    pub async fn release_from_queue(
        &self,
        ride_id: &RideId,
        queue_id: &str,
        actor_id: Option<&str>,
    ) -> Result<Ride> {
        self.adapter
            .transition(
                ride_id,
                RideState::Queued,
                RideState::Open,
                with_actor(TransitionOptions::new().queue_id(queue_id), actor_id),
            )
            .await
    }
}

fn with_actor(options: TransitionOptions, actor_id: Option<&str>) -> TransitionOptions {
    match actor_id {
        Some(actor) => options.actor(actor),
        None => options,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use ride_dispatch_testing::{InMemoryDocumentStore, fixtures, test_clock};
    use serde_json::json;

    fn coordinator(store: &InMemoryDocumentStore) -> ClaimCoordinator {
        let adapter = RideStoreAdapter::new(Arc::new(store.clone()), Arc::new(test_clock()))
            .with_retry_policy(RetryPolicy::no_retry());
        ClaimCoordinator::new(Arc::new(adapter))
    }

    fn ride(id: &str) -> RideId {
        RideId::new(id)
    }

    fn driver(id: &str) -> DriverId {
        DriverId::new(id)
    }

    #[tokio::test]
    async fn claim_moves_ride_between_shadows() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");

        let claimed = coordinator(&store)
            .claim(&ride("R-1"), &driver("d-1"), ClaimOptions::default().vehicle("van-3"))
            .await
            .unwrap();

        assert_eq!(claimed.state, RideState::Claimed);
        assert_eq!(claimed.claimed_vehicle.as_deref(), Some("van-3"));
        assert!(!store.contains(Collection::LiveRides, "R-1"));
        let shadow = store.document(Collection::ClaimedRides, "R-1").unwrap();
        assert_eq!(shadow.get("claimedBy"), Some(&json!("d-1")));
        assert_eq!(shadow.get("claimedByName"), Some(&json!("d-1")));
    }

    #[tokio::test]
    async fn claim_guards_are_checked_in_order() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_claimed_ride(&store, "R-1", "d-1");
        store.insert(
            Collection::Rides,
            "R-2",
            fixtures::ride_document("R-2", "completed"),
        );
        let coordinator = coordinator(&store);

        assert!(matches!(
            coordinator.claim(&ride("R-1"), &driver("d-2"), ClaimOptions::default()).await,
            Err(DispatchError::AlreadyClaimed { claimed_by, .. }) if claimed_by == driver("d-1")
        ));
        assert!(matches!(
            coordinator.claim(&ride("R-2"), &driver("d-2"), ClaimOptions::default()).await,
            Err(DispatchError::NotOpen { state: RideState::Completed, .. })
        ));
        assert_eq!(
            coordinator.claim(&ride("R-3"), &driver("d-2"), ClaimOptions::default()).await,
            Err(DispatchError::NotFound(ride("R-3")))
        );
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn undo_requires_the_holder() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_claimed_ride(&store, "R-1", "d-1");
        let coordinator = coordinator(&store);

        assert!(matches!(
            coordinator.undo(&ride("R-1"), &driver("d-2"), None).await,
            Err(DispatchError::NotClaimedByYou { .. })
        ));

        let reopened = coordinator.undo(&ride("R-1"), &driver("d-1"), None).await.unwrap();
        assert!(reopened.is_claimable());
        assert!(store.contains(Collection::LiveRides, "R-1"));
        assert!(!store.contains(Collection::ClaimedRides, "R-1"));

        assert!(matches!(
            coordinator.undo(&ride("R-1"), &driver("d-1"), None).await,
            Err(DispatchError::NotClaimedByYou { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_defaults_reason_and_rejects_terminal_source() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_open_ride(&store, "R-1");
        let coordinator = coordinator(&store);

        let canceled = coordinator
            .cancel(&ride("R-1"), RideState::Open, None, Some("dispatcher-2"))
            .await
            .unwrap();
        assert_eq!(canceled.cancel_reason.as_deref(), Some(DEFAULT_CANCEL_REASON));
        assert!(!store.contains(Collection::LiveRides, "R-1"));

        assert_eq!(
            coordinator
                .cancel(&ride("R-1"), RideState::Completed, None, None)
                .await,
            Err(DispatchError::InvalidTransition {
                from: RideState::Completed,
                to: RideState::Canceled,
            })
        );
    }

    #[tokio::test]
    async fn cancel_queued_ride_consumes_queue_entry() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_queue_entry(&store, "Q-1");

        let canceled = coordinator(&store)
            .cancel(&ride("Q-1"), RideState::Queued, Some("duplicate"), None)
            .await
            .unwrap();

        assert_eq!(canceled.state, RideState::Canceled);
        assert!(!store.contains(Collection::RideQueue, "Q-1"));
        assert!(store.contains(Collection::Rides, "Q-1"));
        assert!(!store.contains(Collection::LiveRides, "Q-1"));
    }
}
