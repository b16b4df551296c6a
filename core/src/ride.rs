//! The canonical ride record and its normalization boundary.
//!
//! Stored ride documents come from several generations of writers and spell
//! the same field many ways (`claimedBy`, `ClaimedBy`; `pickupTime`, `Date`;
//! state as `state` or `status`, in any case). [`Ride::from_document`] resolves every alias exactly once, producing
//! the fixed internal schema below; [`Ride::to_document`] writes the canonical
//! field names back. Nothing downstream of this module ever looks at an alias.
//!
//! A ride is identified by its document key alone. Id fields inside the body
//! are mirrors of that key and are rewritten on every save; business numbers
//! such as `tripId` are ordinary attributes.
//!
//! Fields the engine does not understand are carried verbatim in
//! [`Ride::attributes`] so a transition never drops upstream data.

use crate::document::Document;
use crate::error::DispatchError;
use crate::ids::{DriverId, RideId};
use crate::state::RideState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Mirrors of the document key written by this crate.
const ID_MIRRORS: &[&str] = &["id", "rideId"];
const QUEUE_ID_ALIASES: &[&str] = &["queueId", "queue_id"];
const STATE_ALIASES: &[&str] = &["state", "status", "queueStatus"];
const CLAIMED_BY_ALIASES: &[&str] = &["claimedBy", "ClaimedBy", "claimed_user"];
const CLAIMED_BY_NAME_ALIASES: &[&str] = &["claimedByName"];
const CLAIMED_VEHICLE_ALIASES: &[&str] = &["claimedVehicle", "claimed_vehicle"];
const CLAIMED_AT_ALIASES: &[&str] = &["claimedAt", "ClaimedAt"];
const CREATED_AT_ALIASES: &[&str] = &["createdAt", "created_at", "created"];
const UPDATED_AT_ALIASES: &[&str] = &["updatedAt", "updated_at"];
const UPDATED_BY_ALIASES: &[&str] = &["updatedBy", "lastModifiedBy"];
const PICKUP_AT_ALIASES: &[&str] = &["pickupAt", "pickupTime", "pickup", "Date"];
const CANCEL_REASON_ALIASES: &[&str] = &["cancelReason"];
const COMPLETED_BY_ALIASES: &[&str] = &["completedBy"];

/// Legacy boolean flag some writers keep next to `claimedBy`.
const LEGACY_CLAIMED_FLAG: &str = "claimed";

const ALL_ALIASES: &[&[&str]] = &[
    ID_MIRRORS,
    QUEUE_ID_ALIASES,
    STATE_ALIASES,
    CLAIMED_BY_ALIASES,
    CLAIMED_BY_NAME_ALIASES,
    CLAIMED_VEHICLE_ALIASES,
    CLAIMED_AT_ALIASES,
    CREATED_AT_ALIASES,
    UPDATED_AT_ALIASES,
    UPDATED_BY_ALIASES,
    PICKUP_AT_ALIASES,
    CANCEL_REASON_ALIASES,
    COMPLETED_BY_ALIASES,
];

/// Whether `name` is a field the normalization step interprets.
///
/// Free-form attributes supplied by callers must not use these names: they
/// would be read back as schema fields on the next load.
#[must_use]
pub fn is_reserved_field(name: &str) -> bool {
    name == LEGACY_CLAIMED_FLAG
        || ALL_ALIASES
            .iter()
            .any(|aliases| aliases.contains(&name))
}

/// A ride in the fixed internal schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Ride {
    /// Immutable ride identifier.
    pub id: RideId,
    /// Originating queue entry, if the ride came through the queue.
    pub queue_id: Option<String>,
    /// Lifecycle state.
    pub state: RideState,
    /// Claiming driver; set iff `state == Claimed`.
    pub claimed_by: Option<DriverId>,
    /// Human-readable name of the claiming driver.
    pub claimed_by_name: Option<String>,
    /// Vehicle associated with the claim.
    pub claimed_vehicle: Option<String>,
    /// When the current claim was made.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the ride first appeared; preserved across every transition.
    pub created_at: Option<DateTime<Utc>>,
    /// Last transition time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Actor of the last transition.
    pub updated_by: Option<String>,
    /// Scheduled pickup time.
    pub pickup_at: Option<DateTime<Utc>>,
    /// Reason recorded on cancellation.
    pub cancel_reason: Option<String>,
    /// Driver that held the claim when the ride was completed.
    pub completed_by: Option<DriverId>,
    /// Every other field of the stored document, untouched.
    pub attributes: Document,
}

impl Ride {
    /// A minimal ride in the given state.
    #[must_use]
    pub fn new(id: impl Into<RideId>, state: RideState) -> Self {
        Self {
            id: id.into(),
            queue_id: None,
            state,
            claimed_by: None,
            claimed_by_name: None,
            claimed_vehicle: None,
            claimed_at: None,
            created_at: None,
            updated_at: None,
            updated_by: None,
            pickup_at: None,
            cancel_reason: None,
            completed_by: None,
            attributes: Document::new(),
        }
    }

    /// Normalize a stored document.
    ///
    /// `key` is the document key and becomes the ride id; id fields in the
    /// body are discarded.
    /// `default_state` applies when the body has no state field at all (queue
    /// entries written before states existed); `None` makes a missing state an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MalformedRecord`] when the state is missing
    /// (without default) or is not a known token.
    pub fn from_document(
        key: &str,
        body: &Document,
        default_state: Option<RideState>,
    ) -> Result<Self, DispatchError> {
        let mut fields = body.clone();
        fields.remove(LEGACY_CLAIMED_FLAG);
        for mirror in ID_MIRRORS {
            fields.remove(*mirror);
        }
        let id = RideId::new(key);

        let malformed = |reason: String| DispatchError::MalformedRecord {
            ride_id: id.clone(),
            reason,
        };

        let state = match take_string(&mut fields, STATE_ALIASES) {
            Some(raw) => RideState::parse_token(&raw).map_err(|e| malformed(e.to_string()))?,
            None => default_state.ok_or_else(|| malformed("missing state".to_string()))?,
        };

        let mut ride = Self {
            id,
            queue_id: take_string(&mut fields, QUEUE_ID_ALIASES),
            state,
            claimed_by: take_string(&mut fields, CLAIMED_BY_ALIASES).map(DriverId::new),
            claimed_by_name: take_string(&mut fields, CLAIMED_BY_NAME_ALIASES),
            claimed_vehicle: take_string(&mut fields, CLAIMED_VEHICLE_ALIASES),
            claimed_at: take_timestamp(&mut fields, CLAIMED_AT_ALIASES),
            created_at: take_timestamp(&mut fields, CREATED_AT_ALIASES),
            updated_at: take_timestamp(&mut fields, UPDATED_AT_ALIASES),
            updated_by: take_string(&mut fields, UPDATED_BY_ALIASES),
            pickup_at: take_timestamp(&mut fields, PICKUP_AT_ALIASES),
            cancel_reason: take_string(&mut fields, CANCEL_REASON_ALIASES),
            completed_by: take_string(&mut fields, COMPLETED_BY_ALIASES).map(DriverId::new),
            attributes: Document::new(),
        };
        ride.attributes = fields;
        Ok(ride)
    }

    /// Serialize with canonical field names.
    ///
    /// `status` mirrors `state` for older readers. Claim fields are written as
    /// explicit `null` when empty so readers that merge documents see the
    /// claim cleared.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = self.attributes.clone();
        doc.insert("id".into(), Value::from(self.id.as_str()));
        doc.insert("rideId".into(), Value::from(self.id.as_str()));
        put_opt_str(&mut doc, "queueId", self.queue_id.as_deref());
        doc.insert("state".into(), Value::from(self.state.as_str()));
        doc.insert("status".into(), Value::from(self.state.as_str()));

        doc.insert(
            "claimedBy".into(),
            self.claimed_by
                .as_ref()
                .map_or(Value::Null, |d| Value::from(d.as_str())),
        );
        doc.insert(
            "claimedVehicle".into(),
            self.claimed_vehicle
                .as_deref()
                .map_or(Value::Null, Value::from),
        );
        doc.insert(
            "claimedAt".into(),
            self.claimed_at.map_or(Value::Null, timestamp_value),
        );
        put_opt_str(&mut doc, "claimedByName", self.claimed_by_name.as_deref());

        put_opt_ts(&mut doc, "createdAt", self.created_at);
        put_opt_ts(&mut doc, "updatedAt", self.updated_at);
        put_opt_str(&mut doc, "updatedBy", self.updated_by.as_deref());
        put_opt_ts(&mut doc, "pickupAt", self.pickup_at);
        put_opt_str(&mut doc, "cancelReason", self.cancel_reason.as_deref());
        put_opt_str(
            &mut doc,
            "completedBy",
            self.completed_by.as_ref().map(DriverId::as_str),
        );
        doc
    }

    /// Open and not held by anyone.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        self.state == RideState::Open && self.claimed_by.is_none()
    }

    /// `claimed_by` is set iff the ride is claimed.
    #[must_use]
    pub fn claim_invariant_holds(&self) -> bool {
        self.claimed_by.is_some() == (self.state == RideState::Claimed)
    }

    /// Drop every claim field.
    pub fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_by_name = None;
        self.claimed_vehicle = None;
        self.claimed_at = None;
    }
}

/// Encode a timestamp the way every writer in this crate does.
#[must_use]
pub fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::from(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Decode a timestamp written as RFC 3339, epoch milliseconds, or a
/// `{seconds, nanoseconds}` object as exported by the upstream database.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(obj) => {
            let seconds = obj
                .get("seconds")
                .or_else(|| obj.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, nanos)
        }
        _ => None,
    }
}

fn string_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Remove every alias from `fields`, returning the first usable value.
fn take_string(fields: &mut Document, aliases: &[&str]) -> Option<String> {
    let mut found = None;
    for alias in aliases {
        if let Some(value) = fields.remove(*alias) {
            if found.is_none() {
                found = string_of(&value);
            }
        }
    }
    found
}

/// Like [`take_string`] for timestamps. Values that do not parse are kept in
/// `fields` under their original key rather than silently discarded.
fn take_timestamp(fields: &mut Document, aliases: &[&str]) -> Option<DateTime<Utc>> {
    let mut found = None;
    let mut unparsed = Vec::new();
    for alias in aliases {
        if let Some(value) = fields.remove(*alias) {
            match parse_timestamp(&value) {
                Some(ts) => {
                    found.get_or_insert(ts);
                }
                None if value.is_null() => {}
                None => unparsed.push(((*alias).to_string(), value)),
            }
        }
    }
    for (alias, value) in unparsed {
        fields.insert(format!("{alias}Raw"), value);
    }
    found
}

fn put_opt_str(doc: &mut Document, key: &str, value: Option<&str>) {
    match value {
        Some(v) => {
            doc.insert(key.to_string(), Value::from(v));
        }
        None => {
            doc.remove(key);
        }
    }
}

fn put_opt_ts(doc: &mut Document, key: &str, value: Option<DateTime<Utc>>) {
    match value {
        Some(ts) => {
            doc.insert(key.to_string(), timestamp_value(ts));
        }
        None => {
            doc.remove(key);
        }
    }
}
