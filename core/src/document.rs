//! Document store abstraction: revisioned JSON documents with atomic batches.
//!
//! The dispatch engine persists rides the way the upstream document database
//! does: schemaless JSON documents grouped into collections. The only
//! concurrency primitive it needs is an all-or-nothing commit guarded by the
//! revisions observed during the read phase (optimistic concurrency):
//!
//! 1. read any number of documents, remembering each revision (or absence)
//! 2. decide locally
//! 3. commit a [`WriteBatch`] whose [`Precondition`]s restate what was read
//!
//! If any precondition no longer holds the store rejects the whole batch with
//! [`StoreError::Conflict`] and writes nothing. Callers re-run steps 1-3.
//!
//! # Implementations
//!
//! - `PostgresDocumentStore` (in `ride-dispatch-postgres`): production
//! - `InMemoryDocumentStore` (in `ride-dispatch-testing`): fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so the store can be shared as
//! `Arc<dyn DocumentStore>` between the coordinator, the batch orchestrator
//! and maintenance jobs.

use crate::ids::Revision;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A schemaless JSON document body.
pub type Document = Map<String, Value>;

/// Boxed future returned by [`DocumentStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Logical collections used by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// Canonical ride records.
    Rides,
    /// Pre-open queue entries.
    RideQueue,
    /// Open shadow: one entry per ride currently `open`.
    LiveRides,
    /// Claimed shadow: one entry per ride currently `claimed`.
    ClaimedRides,
}

impl Collection {
    /// All collections.
    pub const ALL: [Self; 4] = [
        Self::Rides,
        Self::RideQueue,
        Self::LiveRides,
        Self::ClaimedRides,
    ];

    /// Default physical name of the collection.
    #[must_use]
    pub const fn default_name(self) -> &'static str {
        match self {
            Self::Rides => "rides",
            Self::RideQueue => "rideQueue",
            Self::LiveRides => "liveRides",
            Self::ClaimedRides => "claimedRides",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Physical collection names, for deployments that do not use the defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionNames {
    /// Name of [`Collection::Rides`].
    pub rides: String,
    /// Name of [`Collection::RideQueue`].
    pub ride_queue: String,
    /// Name of [`Collection::LiveRides`].
    pub live_rides: String,
    /// Name of [`Collection::ClaimedRides`].
    pub claimed_rides: String,
}

impl CollectionNames {
    /// Physical name of `collection`.
    #[must_use]
    pub fn name(&self, collection: Collection) -> &str {
        match collection {
            Collection::Rides => &self.rides,
            Collection::RideQueue => &self.ride_queue,
            Collection::LiveRides => &self.live_rides,
            Collection::ClaimedRides => &self.claimed_rides,
        }
    }
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            rides: Collection::Rides.default_name().to_string(),
            ride_queue: Collection::RideQueue.default_name().to_string(),
            live_rides: Collection::LiveRides.default_name().to_string(),
            claimed_rides: Collection::ClaimedRides.default_name().to_string(),
        }
    }
}

/// Address of a single document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    /// Collection holding the document.
    pub collection: Collection,
    /// Document id within the collection.
    pub id: String,
}

impl DocumentKey {
    /// Build a key.
    #[must_use]
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A stored document together with its current revision.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedDocument {
    /// Document id within its collection.
    pub id: String,
    /// JSON body.
    pub body: Document,
    /// Revision of the body.
    pub revision: Revision,
}

/// A condition the store must verify before applying a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precondition {
    /// Document the condition is about.
    pub key: DocumentKey,
    /// `Some(r)`: document must exist at revision `r`. `None`: must be absent.
    pub expected: Option<Revision>,
}

/// A buffered write.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Create or fully replace a document.
    Set {
        /// Target document.
        key: DocumentKey,
        /// New body.
        body: Document,
    },
    /// Delete a document. Deleting an absent document is not an error.
    Delete {
        /// Target document.
        key: DocumentKey,
    },
}

impl WriteOp {
    /// The document this write targets.
    #[must_use]
    pub const fn key(&self) -> &DocumentKey {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Preconditions plus writes, applied all-or-nothing by [`DocumentStore::commit`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    preconditions: Vec<Precondition>,
    writes: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            preconditions: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Require `key` to be at `expected` (or absent when `None`) at commit time.
    ///
    /// A later requirement on the same key replaces the earlier one.
    pub fn require(&mut self, key: DocumentKey, expected: Option<Revision>) {
        self.preconditions.retain(|p| p.key != key);
        self.preconditions.push(Precondition { key, expected });
    }

    /// Buffer a full-document write.
    ///
    /// A later write to the same key supersedes the earlier one.
    pub fn set(&mut self, key: DocumentKey, body: Document) {
        self.writes.retain(|w| w.key() != &key);
        self.writes.push(WriteOp::Set { key, body });
    }

    /// Buffer a delete.
    ///
    /// A later write to the same key supersedes the earlier one.
    pub fn delete(&mut self, key: DocumentKey) {
        self.writes.retain(|w| w.key() != &key);
        self.writes.push(WriteOp::Delete { key });
    }

    /// Preconditions in insertion order.
    #[must_use]
    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    /// Writes in insertion order.
    #[must_use]
    pub fn writes(&self) -> &[WriteOp] {
        &self.writes
    }

    /// Whether the batch carries no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Split into preconditions and writes.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Precondition>, Vec<WriteOp>) {
        (self.preconditions, self.writes)
    }
}

/// Errors surfaced by a [`DocumentStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A precondition failed: another writer changed the document since it was read.
    #[error("Write conflict on {key}: expected revision {expected:?}, found {actual:?}")]
    Conflict {
        /// Document whose revision moved.
        key: DocumentKey,
        /// Revision the batch expected (`None` = absent).
        expected: Option<Revision>,
        /// Revision found at commit time (`None` = absent).
        actual: Option<Revision>,
    },

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether re-running the whole unit of work may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

/// Revisioned document storage with atomic, precondition-guarded batches.
///
/// Implementations must be `Send + Sync` and must apply a [`WriteBatch`]
/// atomically: either every precondition holds and every write becomes
/// visible together, or nothing changes.
pub trait DocumentStore: Send + Sync {
    /// Read one document.
    ///
    /// Returns `Ok(None)` when the document does not exist.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: the backend could not be reached
    /// - `Serialization`: the stored body is not a JSON object
    fn get(&self, key: DocumentKey) -> StoreFuture<'_, Option<VersionedDocument>>;

    /// Read every document of a collection, ordered by id.
    ///
    /// Used by maintenance jobs and cache refreshes, never by transition logic.
    ///
    /// # Errors
    ///
    /// Same as [`DocumentStore::get`].
    fn list(&self, collection: Collection) -> StoreFuture<'_, Vec<VersionedDocument>>;

    /// Atomically verify the batch's preconditions and apply its writes.
    ///
    /// # Errors
    ///
    /// - `Conflict`: a precondition failed; nothing was written
    /// - `Unavailable` / `Backend`: the commit did not happen
    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()>;
}
