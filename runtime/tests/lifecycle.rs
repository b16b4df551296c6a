//! Integration tests for the ride lifecycle against the in-memory store
//!
//! Walks rides through queue release, claim, undo, completion and
//! cancellation, checking the canonical record and both shadows after each
//! step.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use ride_dispatch_core::document::Collection;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::{DispatchError, Document, DriverId, Ride, RideId, RideState};
use ride_dispatch_runtime::{
    ClaimCoordinator, ClaimOptions, RetryPolicy, RideStoreAdapter, TransitionOptions,
};
use ride_dispatch_testing::{FixedClock, InMemoryDocumentStore, fixtures, test_clock};
use serde_json::{Value, json};
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn setup() -> (InMemoryDocumentStore, ClaimCoordinator) {
    let (store, _clock, coordinator) = setup_with_clock();
    (store, coordinator)
}

fn setup_with_clock() -> (InMemoryDocumentStore, FixedClock, ClaimCoordinator) {
    let store = InMemoryDocumentStore::new();
    let clock = test_clock();
    let adapter = RideStoreAdapter::new(Arc::new(store.clone()), Arc::new(clock.clone()))
        .with_retry_policy(RetryPolicy::no_retry());
    (store, clock, ClaimCoordinator::new(Arc::new(adapter)))
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("fixture must be a JSON object"),
    }
}

fn ride_in(store: &InMemoryDocumentStore, collection: Collection, id: &str) -> Ride {
    let body = store
        .document(collection, id)
        .unwrap_or_else(|| panic!("{collection:?}/{id} should exist"));
    Ride::from_document(id, &body, None).unwrap()
}

/// Every ride satisfies the claim invariant and sits in exactly the shadows
/// its state calls for.
fn assert_consistent(store: &InMemoryDocumentStore) {
    for id in store.ids(Collection::Rides) {
        let ride = ride_in(store, Collection::Rides, &id);
        assert!(ride.claim_invariant_holds(), "claim invariant broken for {id}");
        assert_eq!(
            store.contains(Collection::LiveRides, &id),
            ride.state == RideState::Open,
            "open shadow out of sync for {id}"
        );
        assert_eq!(
            store.contains(Collection::ClaimedRides, &id),
            ride.state == RideState::Claimed,
            "claimed shadow out of sync for {id}"
        );
    }
    for shadow in [Collection::LiveRides, Collection::ClaimedRides] {
        for id in store.ids(shadow) {
            assert!(store.contains(Collection::Rides, &id), "orphaned shadow {id}");
        }
    }
}

// ============================================================================
// End-to-end
// ============================================================================

#[tokio::test]
async fn queue_release_claim_and_undo() {
    let (store, coordinator) = setup();
    fixtures::seed_queue_entry(&store, "R-100");
    let ride_id = RideId::new("R-100");
    let driver = DriverId::new("driver-7");

    // queued -> open creates the canonical record from the queue entry
    let opened = coordinator
        .adapter()
        .transition(
            &ride_id,
            RideState::Queued,
            RideState::Open,
            TransitionOptions::new().queue_id("R-100"),
        )
        .await
        .unwrap();
    assert_eq!(opened.state, RideState::Open);
    assert!(!store.contains(Collection::RideQueue, "R-100"));
    assert!(store.contains(Collection::LiveRides, "R-100"));
    let canonical = store.document(Collection::Rides, "R-100").unwrap();
    assert_eq!(canonical.get("state"), Some(&Value::from("open")));
    assert_eq!(canonical.get("status"), Some(&Value::from("open")));
    assert_eq!(canonical.get("queueId"), Some(&Value::from("R-100")));
    // Unknown upstream fields survive the move
    assert_eq!(canonical.get("vehicle"), Some(&Value::from("Limo Bus")));
    assert_consistent(&store);

    // open -> claimed moves it between shadows
    let claimed = coordinator
        .claim(&ride_id, &driver, ClaimOptions::default().vehicle("VAN-2"))
        .await
        .unwrap();
    assert_eq!(claimed.state, RideState::Claimed);
    assert_eq!(claimed.claimed_by, Some(driver.clone()));
    assert!(!store.contains(Collection::LiveRides, "R-100"));
    let shadow = ride_in(&store, Collection::ClaimedRides, "R-100");
    assert_eq!(shadow.claimed_by, Some(driver.clone()));
    assert_eq!(shadow.claimed_vehicle.as_deref(), Some("VAN-2"));
    assert_consistent(&store);

    // undo returns it to the live pool
    let reopened = coordinator.undo(&ride_id, &driver, None).await.unwrap();
    assert_eq!(reopened.state, RideState::Open);
    assert_eq!(reopened.claimed_by, None);
    assert!(!store.contains(Collection::ClaimedRides, "R-100"));
    assert!(store.contains(Collection::LiveRides, "R-100"));
    assert_consistent(&store);
}

#[tokio::test]
async fn undo_restores_original_created_at() {
    let (store, coordinator) = setup();
    fixtures::seed_open_ride(&store, "R-1");
    let ride_id = RideId::new("R-1");
    let driver = DriverId::new("d-1");
    let original = ride_in(&store, Collection::LiveRides, "R-1").created_at;
    assert!(original.is_some());

    coordinator
        .claim(&ride_id, &driver, ClaimOptions::default())
        .await
        .unwrap();
    coordinator.undo(&ride_id, &driver, Some("d-1")).await.unwrap();

    let shadow = ride_in(&store, Collection::LiveRides, "R-1");
    assert_eq!(shadow.created_at, original);
    assert_eq!(shadow.updated_by.as_deref(), Some("d-1"));
}

#[tokio::test]
async fn created_at_stamped_on_first_open_survives_claim_and_undo() {
    let (store, clock, coordinator) = setup_with_clock();
    store.insert(Collection::Rides, "R-2", object(json!({"state": "queued"})));
    let ride_id = RideId::new("R-2");
    let driver = DriverId::new("d-1");
    let opened_at = clock.now();

    coordinator
        .adapter()
        .transition(&ride_id, RideState::Queued, RideState::Open, TransitionOptions::new())
        .await
        .unwrap();
    assert_eq!(ride_in(&store, Collection::Rides, "R-2").created_at, Some(opened_at));
    assert_eq!(ride_in(&store, Collection::LiveRides, "R-2").created_at, Some(opened_at));

    clock.advance(chrono::Duration::hours(1));
    coordinator
        .claim(&ride_id, &driver, ClaimOptions::default())
        .await
        .unwrap();
    clock.advance(chrono::Duration::hours(1));
    coordinator.undo(&ride_id, &driver, None).await.unwrap();

    assert_eq!(ride_in(&store, Collection::LiveRides, "R-2").created_at, Some(opened_at));
    assert_eq!(ride_in(&store, Collection::Rides, "R-2").created_at, Some(opened_at));
    assert_consistent(&store);
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn shadows_follow_the_document_key_not_the_trip_number() {
    let (store, coordinator) = setup();
    let body = object(json!({
        "state": "open",
        "tripId": "T-55",
        "createdAt": "2024-12-31T12:00:00.000Z",
    }));
    store.insert(Collection::Rides, "R-1", body.clone());
    store.insert(Collection::LiveRides, "R-1", body);

    let claimed = coordinator
        .claim(&RideId::new("R-1"), &DriverId::new("d-1"), ClaimOptions::default())
        .await
        .unwrap();

    assert_eq!(claimed.id, RideId::new("R-1"));
    assert_eq!(store.ids(Collection::LiveRides), Vec::<String>::new());
    assert_eq!(store.ids(Collection::ClaimedRides), vec!["R-1".to_string()]);
    let canonical = store.document(Collection::Rides, "R-1").unwrap();
    assert_eq!(canonical.get("id"), Some(&Value::from("R-1")));
    assert_eq!(canonical.get("tripId"), Some(&Value::from("T-55")));
    assert_consistent(&store);
}

#[tokio::test]
async fn transitions_ignore_a_stale_id_in_the_body() {
    let (store, coordinator) = setup();
    let body = object(json!({"id": "R-9", "rideId": "R-9", "state": "open"}));
    store.insert(Collection::Rides, "R-3", body.clone());
    store.insert(Collection::LiveRides, "R-3", body);

    let canceled = coordinator
        .cancel(&RideId::new("R-3"), RideState::Open, Some("duplicate"), None)
        .await
        .unwrap();

    assert_eq!(canceled.id, RideId::new("R-3"));
    assert!(!store.contains(Collection::LiveRides, "R-3"));
    assert!(!store.contains(Collection::Rides, "R-9"));
    assert_consistent(&store);
}

// ============================================================================
// Claim guards
// ============================================================================

#[tokio::test]
async fn reclaiming_by_the_same_driver_is_idempotent() {
    let (store, coordinator) = setup();
    fixtures::seed_open_ride(&store, "R-1");
    let ride_id = RideId::new("R-1");
    let driver = DriverId::new("d-1");

    let first = coordinator
        .claim(&ride_id, &driver, ClaimOptions::default())
        .await
        .unwrap();
    let commits = store.commits();
    let second = coordinator
        .claim(&ride_id, &driver, ClaimOptions::default())
        .await
        .unwrap();

    assert_eq!(first.claimed_by, second.claimed_by);
    assert_eq!(first.claimed_at, second.claimed_at);
    assert_eq!(store.commits(), commits, "second claim must not write");
    assert_eq!(store.len(Collection::ClaimedRides), 1);
    assert_consistent(&store);
}

#[tokio::test]
async fn second_driver_sees_already_claimed() {
    let (store, coordinator) = setup();
    fixtures::seed_open_ride(&store, "R-1");
    let ride_id = RideId::new("R-1");

    coordinator
        .claim(&ride_id, &DriverId::new("d-1"), ClaimOptions::default())
        .await
        .unwrap();
    let result = coordinator
        .claim(&ride_id, &DriverId::new("d-2"), ClaimOptions::default())
        .await;

    assert_eq!(
        result,
        Err(DispatchError::AlreadyClaimed {
            ride_id: ride_id.clone(),
            claimed_by: DriverId::new("d-1"),
        })
    );
    let ride = ride_in(&store, Collection::Rides, "R-1");
    assert_eq!(ride.claimed_by, Some(DriverId::new("d-1")));

    // and may not undo someone else's claim
    let undo = coordinator.undo(&ride_id, &DriverId::new("d-2"), None).await;
    assert!(matches!(undo, Err(DispatchError::NotClaimedByYou { .. })));
    assert_consistent(&store);
}

#[tokio::test]
async fn illegal_transition_never_touches_the_store() {
    let (store, coordinator) = setup();
    fixtures::seed_queue_entry(&store, "R-1");

    let result = coordinator
        .adapter()
        .transition(
            &RideId::new("R-1"),
            RideState::Queued,
            RideState::Completed,
            TransitionOptions::new(),
        )
        .await;

    assert!(matches!(result, Err(DispatchError::InvalidTransition { .. })));
    assert_eq!(store.reads(), 0);
    assert_eq!(store.commits(), 0);
}

// ============================================================================
// Terminal states
// ============================================================================

#[tokio::test]
async fn completion_clears_claim_and_records_driver() {
    let (store, coordinator) = setup();
    fixtures::seed_claimed_ride(&store, "R-1", "d-1");

    let done = coordinator
        .complete(&RideId::new("R-1"), Some("dispatcher-3"))
        .await
        .unwrap();

    assert_eq!(done.state, RideState::Completed);
    assert_eq!(done.claimed_by, None);
    assert_eq!(done.completed_by, Some(DriverId::new("d-1")));
    let body = store.document(Collection::Rides, "R-1").unwrap();
    assert_eq!(body.get("claimedBy"), Some(&Value::Null));
    assert_eq!(body.get("updatedBy"), Some(&Value::from("dispatcher-3")));
    assert!(!store.contains(Collection::ClaimedRides, "R-1"));
    assert_consistent(&store);
}

#[tokio::test]
async fn cancel_from_queue_and_from_open() {
    let (store, coordinator) = setup();
    fixtures::seed_queue_entry(&store, "R-1");
    fixtures::seed_open_ride(&store, "R-2");

    let queued = coordinator
        .cancel(&RideId::new("R-1"), RideState::Queued, None, None)
        .await
        .unwrap();
    let open = coordinator
        .cancel(&RideId::new("R-2"), RideState::Open, Some("no-show"), None)
        .await
        .unwrap();

    assert_eq!(queued.cancel_reason.as_deref(), Some("unspecified"));
    assert_eq!(open.cancel_reason.as_deref(), Some("no-show"));
    assert!(!store.contains(Collection::RideQueue, "R-1"));
    assert!(!store.contains(Collection::LiveRides, "R-2"));
    assert_consistent(&store);

    // terminal states have no exits
    let again = coordinator
        .cancel(&RideId::new("R-2"), RideState::Canceled, None, None)
        .await;
    assert!(matches!(again, Err(DispatchError::InvalidTransition { .. })));
}

#[tokio::test]
async fn stale_expectation_is_a_state_mismatch() {
    let (store, coordinator) = setup();
    fixtures::seed_claimed_ride(&store, "R-1", "d-1");

    let result = coordinator
        .cancel(&RideId::new("R-1"), RideState::Open, None, None)
        .await;

    assert_eq!(
        result,
        Err(DispatchError::StateMismatch {
            ride_id: RideId::new("R-1"),
            expected: RideState::Open,
            found: RideState::Claimed,
        })
    );
    assert_consistent(&store);
}

#[tokio::test]
async fn missing_ride_is_not_found() {
    let (_store, coordinator) = setup();
    let result = coordinator
        .claim(&RideId::new("R-404"), &DriverId::new("d-1"), ClaimOptions::default())
        .await;
    assert_eq!(result, Err(DispatchError::NotFound(RideId::new("R-404"))));
}
