//! Claim Desk - a scripted dispatcher session
//!
//! Walks a handful of rides through the whole lifecycle: the morning queue
//! release, a claim and its undo, a batch claim, completion and cancellation,
//! then rebuilds the shadow collections and reports what it fixed.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p claim-desk
//!
//! # against PostgreSQL
//! DISPATCH_STORE=postgres DATABASE_URL=postgres://localhost/dispatch \
//!     cargo run -p claim-desk --features postgres
//! ```
//!
//! Metrics are served on `METRICS_ADDR` (default <http://localhost:9090/metrics>)
//! while the session runs. Configuration can also be placed in a `.env` file.

use ride_dispatch_core::document::{Collection, Document, DocumentKey, DocumentStore, WriteBatch};
use ride_dispatch_core::environment::{Clock, SystemClock};
use ride_dispatch_core::gate::Role;
use ride_dispatch_core::{DispatchError, DriverId, RideId, RideState};
use ride_dispatch_runtime::metrics::MetricsServer;
use ride_dispatch_runtime::{
    BatchClaimOrchestrator, ClaimCoordinator, ClaimOptions, DispatchConfig, KnownRides,
    RideStoreAdapter, ShadowMaintenance, TransitionOptions,
};
use ride_dispatch_testing::InMemoryDocumentStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const RIDES: [&str; 4] = ["R-100", "R-101", "R-102", "R-103"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claim_desk=info,ride_dispatch_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DispatchConfig::from_env();
    info!(
        blackout_start = config.gate.blackout.start_hour(),
        blackout_end = config.gate.blackout.end_hour(),
        timezone = %config.gate.timezone,
        max_retries = config.transactions.max_retries,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    if let Err(error) = metrics.start() {
        warn!(%error, "Metrics disabled");
    }

    let store = build_store(&config).await?;
    seed_queue(store.as_ref()).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let adapter = Arc::new(
        RideStoreAdapter::new(Arc::clone(&store), Arc::clone(&clock))
            .with_retry_policy(config.retry_policy()),
    );
    let coordinator = ClaimCoordinator::new(Arc::clone(&adapter));
    let maintenance = ShadowMaintenance::new(Arc::clone(&adapter));

    // One ride released by hand, claimed and handed back
    let ride_id = RideId::new(RIDES[0]);
    let driver = DriverId::new("driver-7");
    coordinator
        .adapter()
        .transition(
            &ride_id,
            RideState::Queued,
            RideState::Open,
            TransitionOptions::new()
                .queue_id(RIDES[0])
                .actor("dispatcher-1"),
        )
        .await?;
    let claimed = coordinator
        .claim(
            &ride_id,
            &driver,
            ClaimOptions::default().vehicle("VAN-2").actor("driver-7"),
        )
        .await?;
    info!(ride_id = %claimed.id, claimed_by = ?claimed.claimed_by, "Claimed");

    match coordinator
        .claim(&ride_id, &DriverId::new("driver-8"), ClaimOptions::default())
        .await
    {
        Err(DispatchError::AlreadyClaimed { claimed_by, .. }) => {
            info!(%claimed_by, "Second driver turned away");
        }
        other => warn!(?other, "Unexpected result for a competing claim"),
    }

    coordinator.undo(&ride_id, &driver, Some("driver-7")).await?;

    // The rest of the queue goes out with the daily release
    let release = maintenance.release_queue(false).await?;
    info!(released = release.released, skipped = release.skipped, "Queue released");

    // A dispatcher claims everything on screen for one driver
    let known = KnownRides::new();
    known.refresh(store.as_ref()).await?;
    let orchestrator = BatchClaimOrchestrator::new(
        coordinator.clone(),
        config.eligibility_gate(Arc::clone(&clock)),
    );
    let selected: Vec<RideId> = RIDES.iter().map(|id| RideId::new(*id)).collect();
    let batch_driver = DriverId::new("driver-9");
    match orchestrator
        .claim_many(
            &selected,
            &batch_driver,
            &Role::Driver,
            &known,
            ClaimOptions::default().driver_name("Dana"),
        )
        .await
    {
        Ok(outcome) => info!(
            succeeded = outcome.succeeded,
            attempted = outcome.attempted,
            "Batch claim finished"
        ),
        Err(DispatchError::ClaimingClosed) => {
            let gate = orchestrator.gate();
            warn!(
                reopens_at = ?gate.reopens_at(),
                remaining_minutes = gate.blackout_remaining().num_minutes(),
                "Claiming is closed right now"
            );
        }
        Err(error) => return Err(error.into()),
    }

    // Close out two rides
    if let Ok(ride) = coordinator.complete(&RideId::new(RIDES[1]), Some("driver-9")).await {
        info!(ride_id = %ride.id, completed_by = ?ride.completed_by, "Completed");
    }
    let canceled = coordinator
        .cancel(
            &RideId::new(RIDES[2]),
            adapter.get_ride(&RideId::new(RIDES[2])).await?.state,
            Some("passenger no-show"),
            Some("dispatcher-1"),
        )
        .await?;
    info!(ride_id = %canceled.id, reason = ?canceled.cancel_reason, "Canceled");

    let rebuild = maintenance.rebuild_shadows().await?;
    info!(
        scanned = rebuild.scanned,
        repaired = rebuild.open_upserts + rebuild.claimed_upserts + rebuild.stale_removed,
        "Shadow check finished"
    );

    for id in RIDES {
        let ride = adapter.get_ride(&RideId::new(id)).await?;
        info!(ride_id = id, state = %ride.state, claimed_by = ?ride.claimed_by, "Final state");
    }

    if let Some(rendered) = metrics.render() {
        info!(bytes = rendered.len(), "Metrics snapshot rendered");
    }
    Ok(())
}

/// Pick the backing store from `DISPATCH_STORE` (`memory` or `postgres`).
#[cfg_attr(not(feature = "postgres"), allow(unused_variables, clippy::unused_async))]
async fn build_store(config: &DispatchConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match std::env::var("DISPATCH_STORE").as_deref() {
        #[cfg(feature = "postgres")]
        Ok("postgres") => {
            let store = ride_dispatch_postgres::PostgresDocumentStore::connect(
                &config.postgres.url,
                config.postgres.max_connections,
            )
            .await?
            .with_collection_names(config.collections.clone());
            store.migrate().await?;
            info!("Using PostgreSQL document store");
            Ok(Arc::new(store))
        }
        Ok(other) if other != "memory" => {
            anyhow::bail!("unsupported DISPATCH_STORE `{other}`")
        }
        _ => {
            info!("Using in-memory document store");
            Ok(Arc::new(InMemoryDocumentStore::new()))
        }
    }
}

/// Reset the demo rides to fresh queue entries.
async fn seed_queue(store: &dyn DocumentStore) -> anyhow::Result<()> {
    let mut batch = WriteBatch::new();
    for id in RIDES {
        for collection in [
            Collection::Rides,
            Collection::LiveRides,
            Collection::ClaimedRides,
        ] {
            batch.delete(DocumentKey::new(collection, id));
        }
        batch.set(
            DocumentKey::new(Collection::RideQueue, id),
            queue_entry(id),
        );
    }
    store.commit(batch).await?;
    info!(rides = RIDES.len(), "Queue seeded");
    Ok(())
}

/// A pending ride as the booking side leaves it in the queue.
fn queue_entry(id: &str) -> Document {
    let entry = json!({
        "tripId": id,
        "pickupTime": "2025-01-02T15:00:00.000Z",
        "passenger": "Front desk walk-in",
        "vehicle": "Limo Bus",
    });
    match entry {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
