//! Document store boundary.
//!
//! This module defines the storage abstraction the job storage layer is built
//! on: single-document atomicity, etag-based optimistic concurrency, batched
//! all-or-nothing commits, server-side increments and expiry metadata.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use query::{DocumentQuery, FieldFilter, Order};
pub use r#trait::{DocumentStore, ExpectedEtag, StoreError, StoredDocument, WriteBatch, WriteOp};
