//! One atomic unit of work against a [`DocumentStore`].
//!
//! Every document read through a [`UnitOfWork`] (including the discovery that
//! it is absent) becomes a precondition of the final commit, and every write is
//! buffered until [`UnitOfWork::commit`]. The commit therefore succeeds only if
//! nothing the decision was based on has changed, and then applies every write
//! together. A unit of work that is dropped without committing has no effect.

use ride_dispatch_core::document::{
    Collection, Document, DocumentKey, DocumentStore, StoreError, VersionedDocument, WriteBatch,
};
use std::collections::HashSet;

/// Buffered reads-as-preconditions and writes for a single commit.
pub struct UnitOfWork<'a> {
    store: &'a dyn DocumentStore,
    batch: WriteBatch,
    observed: HashSet<DocumentKey>,
}

impl<'a> UnitOfWork<'a> {
    /// Start an empty unit of work.
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
            observed: HashSet::new(),
        }
    }

    /// Read a document and pin its current revision (or absence).
    ///
    /// Only the first read of a key is pinned: if a later read sees a
    /// different revision the commit fails anyway.
    ///
    /// # Errors
    ///
    /// Propagates the store's read error.
    pub async fn read(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<VersionedDocument>, StoreError> {
        let key = DocumentKey::new(collection, id);
        let found = self.store.get(key.clone()).await?;
        if self.observed.insert(key.clone()) {
            self.batch
                .require(key, found.as_ref().map(|doc| doc.revision));
        }
        Ok(found)
    }

    /// Buffer a full replacement of a document.
    pub fn set(&mut self, collection: Collection, id: &str, body: Document) {
        self.batch.set(DocumentKey::new(collection, id), body);
    }

    /// Buffer an unconditional delete. Deleting an absent document is not an error.
    pub fn delete(&mut self, collection: Collection, id: &str) {
        self.batch.delete(DocumentKey::new(collection, id));
    }

    /// Whether any write has been buffered.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        !self.batch.is_empty()
    }

    /// The batch that would be committed.
    #[must_use]
    pub const fn batch(&self) -> &WriteBatch {
        &self.batch
    }

    /// Commit every buffered write, guarded by every pinned read.
    ///
    /// A unit of work with no writes commits nothing.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if a pinned document changed; nothing is written.
    pub async fn commit(self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.store.commit(self.batch).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ride_dispatch_core::Revision;
    use ride_dispatch_testing::InMemoryDocumentStore;

    #[tokio::test]
    async fn reads_become_preconditions() {
        let store = InMemoryDocumentStore::new();
        store.insert(Collection::Rides, "R-1", Document::new());

        let mut uow = UnitOfWork::new(&store);
        assert!(uow.read(Collection::Rides, "R-1").await.unwrap().is_some());
        assert!(uow.read(Collection::RideQueue, "R-1").await.unwrap().is_none());

        let preconditions = uow.batch().preconditions();
        assert_eq!(preconditions.len(), 2);
        assert_eq!(preconditions[0].expected, Some(Revision::INITIAL));
        assert_eq!(preconditions[1].expected, None);
    }

    #[tokio::test]
    async fn concurrent_write_fails_the_commit() {
        let store = InMemoryDocumentStore::new();
        store.insert(Collection::Rides, "R-1", Document::new());

        let mut uow = UnitOfWork::new(&store);
        uow.read(Collection::Rides, "R-1").await.unwrap();
        uow.set(Collection::LiveRides, "R-1", Document::new());

        store.insert(Collection::Rides, "R-1", Document::new());

        assert!(matches!(
            uow.commit().await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(!store.contains(Collection::LiveRides, "R-1"));
    }

    #[tokio::test]
    async fn read_only_unit_does_not_commit() {
        let store = InMemoryDocumentStore::new();
        let mut uow = UnitOfWork::new(&store);
        uow.read(Collection::Rides, "R-1").await.unwrap();
        assert!(!uow.has_writes());
        uow.commit().await.unwrap();
        assert_eq!(store.commits(), 0);
    }
}
