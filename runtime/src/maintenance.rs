//! Maintenance jobs: shadow rebuild and the daily queue release.
//!
//! Shadows are derived state, so they can always be recomputed from the
//! canonical rides. [`ShadowMaintenance::rebuild_shadows`] does that one ride
//! at a time, each in its own unit of work, so it can run while dispatchers
//! are claiming. [`ShadowMaintenance::release_queue`] opens every pending
//! queue entry through the normal transition protocol.

use crate::adapter::{RideStoreAdapter, TransitionOptions};
use crate::shadow::shadow_document;
use ride_dispatch_core::document::{Collection, Document};
use ride_dispatch_core::{DispatchError, Result, Ride, RideId, RideState};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Actor recorded on rides opened by the queue release.
pub const QUEUE_RELEASE_ACTOR: &str = "system:queue-release";

/// Counts from [`ShadowMaintenance::rebuild_shadows`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Canonical rides examined.
    pub scanned: usize,
    /// Open Shadow entries created or rewritten.
    pub open_upserts: usize,
    /// Claimed Shadow entries created or rewritten.
    pub claimed_upserts: usize,
    /// Shadow entries removed because their ride is not in that state.
    pub stale_removed: usize,
    /// Rides that could not be processed.
    pub failed: Vec<(RideId, DispatchError)>,
}

/// Counts from [`ShadowMaintenance::release_queue`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueReleaseReport {
    /// Queue entries found.
    pub queue_total: usize,
    /// Entries released to `open` (or that would be, in a dry run).
    pub released: usize,
    /// Entries left alone: claimed, not queued, or already released.
    pub skipped: usize,
    /// Entries whose release failed.
    pub failed: Vec<(RideId, DispatchError)>,
}

#[derive(Default)]
struct ShadowFix {
    open_upserts: usize,
    claimed_upserts: usize,
    stale_removed: usize,
}

/// Batch jobs over the whole ride population.
#[derive(Clone, Debug)]
pub struct ShadowMaintenance {
    adapter: Arc<RideStoreAdapter>,
}

impl ShadowMaintenance {
    /// Create the jobs over `adapter`.
    #[must_use]
    pub const fn new(adapter: Arc<RideStoreAdapter>) -> Self {
        Self { adapter }
    }

    /// Recompute both shadows from the canonical rides.
    ///
    /// Missing or outdated entries are rewritten and entries whose ride is in
    /// another state (or no longer exists) are removed.
    ///
    /// # Errors
    ///
    /// Only listing failures abort the job; per-ride failures are reported.
    #[tracing::instrument(skip_all)]
    pub async fn rebuild_shadows(&self) -> Result<RebuildReport> {
        let store = self.adapter.store();
        let rides = store.list(Collection::Rides).await?;
        let mut ids: BTreeSet<String> = rides.into_iter().map(|doc| doc.id).collect();
        let canonical = ids.len();
        for shadow in [Collection::LiveRides, Collection::ClaimedRides] {
            ids.extend(store.list(shadow).await?.into_iter().map(|doc| doc.id));
        }

        let mut report = RebuildReport {
            scanned: canonical,
            ..RebuildReport::default()
        };
        for id in ids {
            match self
                .adapter
                .atomically("rebuild_shadow", || self.rebuild_one(&id))
                .await
            {
                Ok(fix) => {
                    report.open_upserts += fix.open_upserts;
                    report.claimed_upserts += fix.claimed_upserts;
                    report.stale_removed += fix.stale_removed;
                }
                Err(error) => {
                    tracing::warn!(ride_id = %id, %error, "Shadow rebuild failed for ride");
                    report.failed.push((RideId::new(id), error));
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            open_upserts = report.open_upserts,
            claimed_upserts = report.claimed_upserts,
            stale_removed = report.stale_removed,
            failed = report.failed.len(),
            "Shadow rebuild finished"
        );
        Ok(report)
    }

    async fn rebuild_one(&self, id: &str) -> Result<ShadowFix> {
        let mut uow = self.adapter.begin();
        let ride = match uow.read(Collection::Rides, id).await? {
            Some(doc) => Some(Ride::from_document(id, &doc.body, None)?),
            None => None,
        };
        let now = self.adapter.now();

        let mut fix = ShadowFix::default();
        for (collection, shadowed) in [
            (Collection::LiveRides, RideState::Open),
            (Collection::ClaimedRides, RideState::Claimed),
        ] {
            let existing = uow.read(collection, id).await?.map(|doc| doc.body);
            let wanted: Option<Document> = ride
                .as_ref()
                .filter(|ride| ride.state == shadowed)
                .map(|ride| {
                    let created_at = existing
                        .as_ref()
                        .and_then(|body| Ride::from_document(id, body, Some(shadowed)).ok())
                        .and_then(|shadow| shadow.created_at)
                        .unwrap_or(now);
                    shadow_document(ride, created_at)
                });

            match (existing, wanted) {
                (Some(_), None) => {
                    uow.delete(collection, id);
                    fix.stale_removed += 1;
                }
                (existing, Some(body)) if existing.as_ref() != Some(&body) => {
                    uow.set(collection, id, body);
                    if shadowed == RideState::Open {
                        fix.open_upserts += 1;
                    } else {
                        fix.claimed_upserts += 1;
                    }
                }
                _ => {}
            }
        }

        uow.commit().await?;
        Ok(fix)
    }

    /// Release every pending queue entry into the live pool.
    ///
    /// Entries that carry a claimant, are not `queued`, or whose ride already
    /// left `queued` are skipped. With `dry_run` nothing is written and
    /// `released` counts what would have been.
    ///
    /// # Errors
    ///
    /// Only listing failures abort the job; per-entry failures are reported.
    #[tracing::instrument(skip_all, fields(dry_run = dry_run))]
    pub async fn release_queue(&self, dry_run: bool) -> Result<QueueReleaseReport> {
        let store = self.adapter.store();
        let entries = store.list(Collection::RideQueue).await?;
        let mut report = QueueReleaseReport {
            queue_total: entries.len(),
            ..QueueReleaseReport::default()
        };

        for entry in entries {
            let ride = match Ride::from_document(&entry.id, &entry.body, Some(RideState::Queued)) {
                Ok(ride) => ride,
                Err(error) => {
                    tracing::warn!(queue_id = %entry.id, %error, "Unreadable queue entry");
                    report.failed.push((RideId::new(entry.id), error));
                    continue;
                }
            };
            if ride.state != RideState::Queued || ride.claimed_by.is_some() {
                tracing::debug!(queue_id = %entry.id, state = %ride.state, "Queue entry not releasable");
                report.skipped += 1;
                continue;
            }

            if dry_run {
                match self.adapter.get_ride(&ride.id).await {
                    Err(DispatchError::NotFound(_)) => report.released += 1,
                    Ok(existing) if existing.state == RideState::Queued => report.released += 1,
                    Ok(_) => report.skipped += 1,
                    Err(error) => report.failed.push((ride.id, error)),
                }
                continue;
            }

            let before = self.adapter.get_ride(&ride.id).await.ok().map(|r| r.state);
            let options = TransitionOptions::new()
                .actor(QUEUE_RELEASE_ACTOR)
                .queue_id(entry.id.clone());
            match self
                .adapter
                .transition(&ride.id, RideState::Queued, RideState::Open, options)
                .await
            {
                Ok(_) if before == Some(RideState::Open) => report.skipped += 1,
                Ok(_) => report.released += 1,
                Err(DispatchError::StateMismatch { .. }) => report.skipped += 1,
                Err(error) => {
                    tracing::warn!(queue_id = %entry.id, %error, "Queue release failed for entry");
                    report.failed.push((ride.id, error));
                }
            }
        }

        tracing::info!(
            queue_total = report.queue_total,
            released = report.released,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Queue release finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use ride_dispatch_testing::{InMemoryDocumentStore, fixtures, test_clock};
    use serde_json::Value;

    fn maintenance(store: &InMemoryDocumentStore) -> ShadowMaintenance {
        let adapter = RideStoreAdapter::new(Arc::new(store.clone()), Arc::new(test_clock()))
            .with_retry_policy(RetryPolicy::no_retry());
        ShadowMaintenance::new(Arc::new(adapter))
    }

    #[tokio::test]
    async fn rebuild_repairs_missing_stale_and_orphaned_entries() {
        let store = InMemoryDocumentStore::new();
        // Open ride with no Open Shadow entry.
        store.insert(Collection::Rides, "R-1", fixtures::ride_document("R-1", "open"));
        // Claimed ride still listed as open.
        store.insert(
            Collection::Rides,
            "R-2",
            fixtures::claimed_ride_document("R-2", "d-1"),
        );
        store.insert(Collection::LiveRides, "R-2", fixtures::ride_document("R-2", "open"));
        // Claimed Shadow entry whose ride is gone.
        store.insert(
            Collection::ClaimedRides,
            "R-9",
            fixtures::claimed_ride_document("R-9", "d-2"),
        );

        let jobs = maintenance(&store);
        let report = jobs.rebuild_shadows().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.open_upserts, 1);
        assert_eq!(report.claimed_upserts, 1);
        assert_eq!(report.stale_removed, 2);
        assert!(report.failed.is_empty());

        assert_eq!(store.ids(Collection::LiveRides), vec!["R-1".to_string()]);
        assert_eq!(store.ids(Collection::ClaimedRides), vec!["R-2".to_string()]);
        let claimed = store.document(Collection::ClaimedRides, "R-2").unwrap();
        assert_eq!(claimed.get("claimedByName"), Some(&Value::from("d-1")));
        assert_eq!(claimed.get("createdAt"), Some(&Value::from(fixtures::CREATED_AT)));

        let again = jobs.rebuild_shadows().await.unwrap();
        assert_eq!(again.open_upserts + again.claimed_upserts + again.stale_removed, 0);
    }

    #[tokio::test]
    async fn rebuild_reports_malformed_rides_and_continues() {
        let store = InMemoryDocumentStore::new();
        let mut broken = fixtures::ride_document("R-1", "open");
        broken.remove("state");
        broken.remove("status");
        store.insert(Collection::Rides, "R-1", broken);
        store.insert(Collection::Rides, "R-2", fixtures::ride_document("R-2", "open"));

        let report = maintenance(&store).rebuild_shadows().await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, RideId::new("R-1"));
        assert!(store.contains(Collection::LiveRides, "R-2"));
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_queue_entry(&store, "Q-1");
        let mut held = fixtures::queue_entry("Q-2");
        held.insert("claimedBy".into(), Value::from("d-1"));
        store.insert(Collection::RideQueue, "Q-2", held);

        let report = maintenance(&store).release_queue(true).await.unwrap();

        assert_eq!(report.queue_total, 2);
        assert_eq!(report.released, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.commits(), 0);
        assert_eq!(store.len(Collection::RideQueue), 2);
    }

    #[tokio::test]
    async fn release_opens_pending_entries() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_queue_entry(&store, "Q-1");
        // Already released earlier; the stale entry is left alone.
        fixtures::seed_open_ride(&store, "R-5");
        fixtures::seed_queue_entry(&store, "R-5");

        let report = maintenance(&store).release_queue(false).await.unwrap();

        assert_eq!(report.released, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());

        let ride = store.document(Collection::Rides, "Q-1").unwrap();
        assert_eq!(ride.get("state"), Some(&Value::from("open")));
        assert_eq!(ride.get("updatedBy"), Some(&Value::from(QUEUE_RELEASE_ACTOR)));
        assert!(store.contains(Collection::LiveRides, "Q-1"));
        assert!(!store.contains(Collection::RideQueue, "Q-1"));
        assert!(store.contains(Collection::RideQueue, "R-5"));
    }
}
