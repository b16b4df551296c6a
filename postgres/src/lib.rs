//! `PostgreSQL` document store for the ride dispatch engine.
//!
//! This crate provides a PostgreSQL-backed implementation of the
//! `DocumentStore` trait from `ride-dispatch-core`. It uses sqlx and supports:
//!
//! - Revisioned JSON documents in a single `dispatch_documents` table
//! - All-or-nothing commits guarded by row locks and revision checks
//! - Configurable physical collection names
//! - Connection pooling
//!
//! # Example
//!
//! ```ignore
//! use ride_dispatch_postgres::PostgresDocumentStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresDocumentStore::connect("postgres://localhost/dispatch", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Document store backed by a `PostgreSQL` table
pub mod document_store;

pub use document_store::PostgresDocumentStore;
