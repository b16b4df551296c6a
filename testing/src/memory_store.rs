//! In-memory document store for fast, deterministic tests.
//!
//! Implements the same all-or-nothing, revision-checked commit as the
//! Postgres store, with hooks to provoke the failure modes that are hard to
//! reach against a real database:
//!
//! - [`InMemoryDocumentStore::fail_next_commits`]: make the next N commits
//!   fail with a given error before touching any data
//! - [`InMemoryDocumentStore::before_next_commit`]: run a closure against the
//!   raw data right before the next commit is validated, simulating a
//!   concurrent writer that lands between a transaction's read and its write
//! - read/commit counters for asserting that an operation never reached the store

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on lock poisoning
#![allow(clippy::missing_panics_doc)]

use ride_dispatch_core::document::{
    Collection, Document, DocumentKey, DocumentStore, StoreError, StoreFuture, VersionedDocument,
    WriteBatch, WriteOp,
};
use ride_dispatch_core::ids::Revision;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

type Hook = Box<dyn FnOnce(&mut InMemoryData) + Send>;

/// Raw contents of an [`InMemoryDocumentStore`], exposed to commit hooks.
#[derive(Debug, Default)]
pub struct InMemoryData {
    documents: BTreeMap<DocumentKey, (Document, Revision)>,
    last_revision: u64,
}

impl InMemoryData {
    fn next_revision(&mut self) -> Revision {
        self.last_revision += 1;
        Revision::new(self.last_revision)
    }

    /// Write a document directly, bumping its revision.
    pub fn put(&mut self, key: DocumentKey, body: Document) {
        let revision = self.next_revision();
        self.documents.insert(key, (body, revision));
    }

    /// Delete a document directly.
    pub fn remove(&mut self, key: &DocumentKey) {
        self.documents.remove(key);
    }

    /// Read a document body directly.
    #[must_use]
    pub fn body(&self, key: &DocumentKey) -> Option<&Document> {
        self.documents.get(key).map(|(body, _)| body)
    }

    fn revision(&self, key: &DocumentKey) -> Option<Revision> {
        self.documents.get(key).map(|(_, rev)| *rev)
    }
}

/// In-memory [`DocumentStore`].
///
/// Clones share the same data, so a test can hand one clone to the engine and
/// keep another for assertions.
///
/// # Example
///
/// ```
/// use ride_dispatch_core::document::{Collection, DocumentKey, DocumentStore, WriteBatch};
/// use ride_dispatch_testing::InMemoryDocumentStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryDocumentStore::new();
/// let key = DocumentKey::new(Collection::Rides, "R-1");
///
/// let mut batch = WriteBatch::new();
/// batch.require(key.clone(), None);
/// batch.set(key.clone(), serde_json::Map::new());
/// store.commit(batch).await?;
///
/// assert!(store.get(key).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    data: Arc<RwLock<InMemoryData>>,
    injected_failures: Arc<Mutex<VecDeque<StoreError>>>,
    hooks: Arc<Mutex<VecDeque<Hook>>>,
    reads: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("documents", &self.data.read().unwrap().documents.len())
            .field("reads", &self.reads())
            .field("commits", &self.commits())
            .finish_non_exhaustive()
    }
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document outside any transaction (test setup).
    pub fn insert(&self, collection: Collection, id: &str, body: Document) {
        self.data
            .write()
            .unwrap()
            .put(DocumentKey::new(collection, id), body);
    }

    /// Body of a document, if present.
    #[must_use]
    pub fn document(&self, collection: Collection, id: &str) -> Option<Document> {
        self.data
            .read()
            .unwrap()
            .body(&DocumentKey::new(collection, id))
            .cloned()
    }

    /// Whether a document exists.
    #[must_use]
    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        self.document(collection, id).is_some()
    }

    /// Ids present in a collection, sorted.
    #[must_use]
    pub fn ids(&self, collection: Collection) -> Vec<String> {
        self.data
            .read()
            .unwrap()
            .documents
            .keys()
            .filter(|k| k.collection == collection)
            .map(|k| k.id.clone())
            .collect()
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.ids(collection).len()
    }

    /// Make the next `count` commits fail with `error`, writing nothing.
    pub fn fail_next_commits(&self, count: usize, error: &StoreError) {
        let mut failures = self.injected_failures.lock().unwrap();
        failures.extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Run `hook` against the raw data immediately before the next commit is
    /// validated.
    pub fn before_next_commit(&self, hook: impl FnOnce(&mut InMemoryData) + Send + 'static) {
        self.hooks.lock().unwrap().push_back(Box::new(hook));
    }

    /// Total `get` and `list` calls served.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Total commits attempted, including rejected ones.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn commit_sync(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.injected_failures.lock().unwrap().pop_front() {
            tracing::debug!(%error, "injected commit failure");
            return Err(error);
        }

        let hook = self.hooks.lock().unwrap().pop_front();
        let mut data = self.data.write().unwrap();
        if let Some(hook) = hook {
            hook(&mut data);
        }

        let (preconditions, writes) = batch.into_parts();
        for precondition in &preconditions {
            let actual = data.revision(&precondition.key);
            if actual != precondition.expected {
                return Err(StoreError::Conflict {
                    key: precondition.key.clone(),
                    expected: precondition.expected,
                    actual,
                });
            }
        }

        for write in writes {
            match write {
                WriteOp::Set { key, body } => data.put(key, body),
                WriteOp::Delete { key } => data.remove(&key),
            }
        }
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, key: DocumentKey) -> StoreFuture<'_, Option<VersionedDocument>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let data = self.data.read().unwrap();
            Ok(data
                .documents
                .get(&key)
                .map(|(body, revision)| VersionedDocument {
                    id: key.id.clone(),
                    body: body.clone(),
                    revision: *revision,
                }))
        })
    }

    fn list(&self, collection: Collection) -> StoreFuture<'_, Vec<VersionedDocument>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let data = self.data.read().unwrap();
            Ok(data
                .documents
                .iter()
                .filter(|(key, _)| key.collection == collection)
                .map(|(key, (body, revision))| VersionedDocument {
                    id: key.id.clone(),
                    body: body.clone(),
                    revision: *revision,
                })
                .collect())
        })
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.commit_sync(batch) })
    }
}
