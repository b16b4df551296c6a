//! Shadow Index Maintainer.
//!
//! The Open Shadow (`liveRides`) and Claimed Shadow (`claimedRides`) are
//! derived copies of canonical rides, one per state. They are written only
//! from inside the unit of work that changes the canonical record, and what
//! gets written is a pure function of `(from, to)`: the maintainer never reads
//! a shadow to decide anything.

use crate::unit_of_work::UnitOfWork;
use chrono::{DateTime, Utc};
use ride_dispatch_core::document::{Collection, Document};
use ride_dispatch_core::ride::timestamp_value;
use ride_dispatch_core::{Ride, RideState};

/// What happens to one shadow collection during a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShadowWrite {
    /// Create or replace the entry from the new record.
    Upsert,
    /// Remove the entry; absence is not an error.
    Delete,
    /// Leave the collection alone.
    Untouched,
}

/// Shadow writes for one transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShadowPlan {
    /// Action on the Open Shadow.
    pub open: ShadowWrite,
    /// Action on the Claimed Shadow.
    pub claimed: ShadowWrite,
}

impl ShadowPlan {
    /// Compute the shadow writes for `from -> to`.
    ///
    /// ```
    /// use ride_dispatch_core::RideState;
    /// use ride_dispatch_runtime::shadow::{ShadowPlan, ShadowWrite};
    ///
    /// let plan = ShadowPlan::for_transition(RideState::Open, RideState::Claimed);
    /// assert_eq!(plan.open, ShadowWrite::Delete);
    /// assert_eq!(plan.claimed, ShadowWrite::Upsert);
    /// ```
    #[must_use]
    pub fn for_transition(from: RideState, to: RideState) -> Self {
        Self {
            open: plan_for(RideState::Open, from, to),
            claimed: plan_for(RideState::Claimed, from, to),
        }
    }
}

fn plan_for(shadowed: RideState, from: RideState, to: RideState) -> ShadowWrite {
    if to == shadowed {
        ShadowWrite::Upsert
    } else if from == shadowed {
        ShadowWrite::Delete
    } else {
        ShadowWrite::Untouched
    }
}

/// Body of a shadow entry for `ride`.
///
/// The creation timestamp is carried over from the ride; `fallback_created_at`
/// is stamped only when the ride never had one.
#[must_use]
pub fn shadow_document(ride: &Ride, fallback_created_at: DateTime<Utc>) -> Document {
    let mut body = ride.to_document();
    body.insert(
        "createdAt".into(),
        timestamp_value(ride.created_at.unwrap_or(fallback_created_at)),
    );
    if ride.state == RideState::Claimed && ride.claimed_by_name.is_none() {
        if let Some(driver) = &ride.claimed_by {
            body.insert("claimedByName".into(), driver.as_str().into());
        }
    }
    body
}

/// Keeps the Open and Claimed shadows consistent with canonical rides.
#[derive(Copy, Clone, Debug, Default)]
pub struct ShadowIndexMaintainer;

impl ShadowIndexMaintainer {
    /// Buffer the shadow writes for `previous -> next` into `uow`.
    ///
    /// `previous` supplies the original creation timestamp when `next` lost it;
    /// `now` is stamped only if neither has one.
    pub fn sync(
        self,
        uow: &mut UnitOfWork<'_>,
        previous: &Ride,
        next: &Ride,
        from: RideState,
        to: RideState,
        now: DateTime<Utc>,
    ) {
        let plan = ShadowPlan::for_transition(from, to);
        let created_at = previous.created_at.or(next.created_at).unwrap_or(now);
        let id = next.id.as_str();

        for (collection, write) in [
            (Collection::LiveRides, plan.open),
            (Collection::ClaimedRides, plan.claimed),
        ] {
            match write {
                ShadowWrite::Upsert => {
                    uow.set(collection, id, shadow_document(next, created_at));
                }
                ShadowWrite::Delete => uow.delete(collection, id),
                ShadowWrite::Untouched => {}
            }
        }
        tracing::trace!(ride_id = %id, ?plan, "Shadow writes buffered");
    }
}
