//! `PostgreSQL` implementation of [`DocumentStore`].
//!
//! All collections share one table:
//!
//! ```sql
//! CREATE TABLE dispatch_documents (
//!     collection TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     body JSONB NOT NULL,
//!     revision BIGINT NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (collection, id)
//! );
//! ```
//!
//! Revisions come from the `dispatch_document_revisions` sequence, so they are
//! unique across the whole store and a recreated document never reuses one.
//!
//! # Commit protocol
//!
//! A commit runs in one transaction:
//!
//! 1. every precondition row is read `FOR UPDATE`, which serializes commits
//!    touching the same document
//! 2. any revision mismatch aborts with [`StoreError::Conflict`]
//! 3. writes are applied; a `Set` on a document required to be absent is a
//!    plain `INSERT`, so a concurrent creator surfaces as a unique violation
//!    and is reported as a conflict too
//!
//! Serialization failures and deadlocks reported by the server are also
//! conflicts; the runtime re-runs the whole unit of work for them.

use ride_dispatch_core::document::{
    Collection, CollectionNames, Document, DocumentKey, DocumentStore, Precondition, StoreError,
    StoreFuture, VersionedDocument, WriteBatch, WriteOp,
};
use ride_dispatch_core::ids::Revision;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::time::Instant;

/// SQLSTATE codes that mean "another transaction got there first".
const CONFLICT_CODES: &[&str] = &[
    "23505", // unique_violation
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

type Row = (String, Value, i64);

/// PostgreSQL-backed document store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    names: CollectionNames,
}

impl PostgresDocumentStore {
    /// Create a store over an existing pool using the default collection names.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            names: CollectionNames::default(),
        }
    }

    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Store documents under `names` instead of the defaults.
    #[must_use]
    pub fn with_collection_names(mut self, names: CollectionNames) -> Self {
        self.names = names;
        self
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Physical name of `collection`.
    #[must_use]
    pub fn collection_name(&self, collection: Collection) -> &str {
        self.names.name(collection)
    }

    async fn get_document(&self, key: DocumentKey) -> Result<Option<VersionedDocument>, StoreError> {
        let row: Option<Row> = sqlx::query_as(
            "SELECT id, body, revision FROM dispatch_documents WHERE collection = $1 AND id = $2",
        )
        .bind(self.collection_name(key.collection))
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| read_error(&e))?;

        row.map(decode_row).transpose()
    }

    async fn list_documents(
        &self,
        collection: Collection,
    ) -> Result<Vec<VersionedDocument>, StoreError> {
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT id, body, revision FROM dispatch_documents WHERE collection = $1 ORDER BY id",
        )
        .bind(self.collection_name(collection))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_error(&e))?;

        rows.into_iter().map(decode_row).collect()
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let started = Instant::now();
        let (preconditions, writes) = batch.into_parts();
        if writes.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| read_error(&e))?;

        for precondition in &preconditions {
            self.check_precondition(&mut tx, precondition).await?;
        }

        let must_be_absent: HashMap<&DocumentKey, bool> = preconditions
            .iter()
            .map(|p| (&p.key, p.expected.is_none()))
            .collect();

        for write in &writes {
            match write {
                WriteOp::Set { key, body } => {
                    let insert_only = must_be_absent.get(key).copied().unwrap_or(false);
                    self.set_document(&mut tx, key, body, insert_only).await?;
                }
                WriteOp::Delete { key } => {
                    sqlx::query("DELETE FROM dispatch_documents WHERE collection = $1 AND id = $2")
                        .bind(self.collection_name(key.collection))
                        .bind(&key.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| write_error(&e, key))?;
                }
            }
        }

        tx.commit().await.map_err(|e| {
            let key = writes.first().map_or_else(
                || DocumentKey::new(Collection::Rides, ""),
                |w| w.key().clone(),
            );
            write_error(&e, &key)
        })?;

        metrics::histogram!("dispatch_store_commit_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::trace!(
            preconditions = preconditions.len(),
            writes = writes.len(),
            "Batch committed"
        );
        Ok(())
    }

    async fn check_precondition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        precondition: &Precondition,
    ) -> Result<(), StoreError> {
        let key = &precondition.key;
        let current: Option<(i64,)> = sqlx::query_as(
            "SELECT revision FROM dispatch_documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(self.collection_name(key.collection))
        .bind(&key.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| write_error(&e, key))?;

        let actual = current.map(|(revision,)| to_revision(revision)).transpose()?;
        if actual == precondition.expected {
            Ok(())
        } else {
            tracing::debug!(%key, expected = ?precondition.expected, ?actual, "Precondition failed");
            Err(StoreError::Conflict {
                key: key.clone(),
                expected: precondition.expected,
                actual,
            })
        }
    }

    async fn set_document(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &DocumentKey,
        body: &Document,
        insert_only: bool,
    ) -> Result<(), StoreError> {
        let sql = if insert_only {
            "INSERT INTO dispatch_documents (collection, id, body, revision)
             VALUES ($1, $2, $3, nextval('dispatch_document_revisions'))"
        } else {
            "INSERT INTO dispatch_documents (collection, id, body, revision)
             VALUES ($1, $2, $3, nextval('dispatch_document_revisions'))
             ON CONFLICT (collection, id) DO UPDATE
             SET body = EXCLUDED.body, revision = EXCLUDED.revision, updated_at = now()"
        };

        sqlx::query(sql)
            .bind(self.collection_name(key.collection))
            .bind(&key.id)
            .bind(Value::Object(body.clone()))
            .execute(&mut **tx)
            .await
            .map_err(|e| write_error(&e, key))?;
        Ok(())
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn get(&self, key: DocumentKey) -> StoreFuture<'_, Option<VersionedDocument>> {
        Box::pin(self.get_document(key))
    }

    fn list(&self, collection: Collection) -> StoreFuture<'_, Vec<VersionedDocument>> {
        Box::pin(self.list_documents(collection))
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = self.commit_batch(batch).await;
            let outcome = match &result {
                Ok(()) => "committed",
                Err(StoreError::Conflict { .. }) => "conflict",
                Err(_) => "error",
            };
            metrics::counter!("dispatch_store_commits_total", "outcome" => outcome).increment(1);
            result
        })
    }
}

fn decode_row((id, body, revision): Row) -> Result<VersionedDocument, StoreError> {
    let Value::Object(body) = body else {
        return Err(StoreError::Serialization(format!(
            "document {id} is not a JSON object"
        )));
    };
    Ok(VersionedDocument {
        id,
        body,
        revision: to_revision(revision)?,
    })
}

fn to_revision(raw: i64) -> Result<Revision, StoreError> {
    u64::try_from(raw)
        .map(Revision::new)
        .map_err(|_| StoreError::Serialization(format!("negative revision {raw}")))
}

/// Whether the error means the database could not be reached.
fn is_unavailable(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn read_error(error: &sqlx::Error) -> StoreError {
    if is_unavailable(error) {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Backend(error.to_string())
    }
}

fn write_error(error: &sqlx::Error, key: &DocumentKey) -> StoreError {
    if let sqlx::Error::Database(db) = error {
        if db.code().is_some_and(|code| CONFLICT_CODES.contains(&code.as_ref())) {
            return StoreError::Conflict {
                key: key.clone(),
                expected: None,
                actual: None,
            };
        }
    }
    read_error(error)
}
