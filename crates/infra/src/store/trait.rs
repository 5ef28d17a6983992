use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use jobdoc_core::{Document, DocumentId, ModelError};
use std::sync::Arc;

use super::query::DocumentQuery;

/// A document as persisted by a [`DocumentStore`].
///
/// ## Etags
///
/// Every successful write bumps `etag`. Sessions remember the etag they loaded
/// and send it back as [`ExpectedEtag::Exact`] on save, which is how
/// optimistic concurrency is detected.
///
/// ## Arrival order
///
/// `sequence` is assigned once, when the document is first created, and never
/// changes afterwards. Queries order by it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub body: JsonValue,
    pub etag: u64,
    pub sequence: u64,
    /// Absolute expiration timestamp; the document stays readable until a
    /// reaper purges it.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredDocument {
    pub fn decode<T: Document>(&self) -> Result<T, StoreError> {
        T::from_json(self.body.clone()).map_err(|e| {
            StoreError::Serialization(format!("document '{}': {e}", self.id))
        })
    }
}

/// Concurrency expectation attached to a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedEtag {
    /// The document must not exist yet.
    Absent,
    /// The document must exist with exactly this etag.
    Exact(u64),
    /// Skip the check.
    Any,
}

impl ExpectedEtag {
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedEtag::Any, _) => true,
            (ExpectedEtag::Absent, None) => true,
            (ExpectedEtag::Exact(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// One write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace (or create) the whole document body.
    Put {
        id: DocumentId,
        body: JsonValue,
        expires_at: Option<DateTime<Utc>>,
        expected: ExpectedEtag,
    },
    /// Remove the document. Deleting a missing document with
    /// `ExpectedEtag::Any` is a no-op.
    Delete { id: DocumentId, expected: ExpectedEtag },
    /// Server-side "add `delta` to integer `field`".
    ///
    /// Applied against the current stored version without a read round trip;
    /// a missing document is created as `{ field: delta }`. A `Some` expiry
    /// replaces the document's expiry, `None` leaves it untouched.
    Increment {
        id: DocumentId,
        field: String,
        delta: i64,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl WriteOp {
    pub fn id(&self) -> &DocumentId {
        match self {
            WriteOp::Put { id, .. } | WriteOp::Delete { id, .. } | WriteOp::Increment { id, .. } => {
                id
            }
        }
    }
}

/// Ordered set of writes committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Document store operation error.
///
/// ## Error Categories
///
/// - **Concurrency**: an etag expectation failed; the whole batch was rejected
///   and the caller may rebuild its unit of work and retry
/// - **Serialization**: a body did not match the expected document shape
/// - **InvalidQuery**: the query cannot be evaluated (e.g. empty path)
/// - **NotFound**: an operation required a document that does not exist
/// - **Backend**: IO, pool or lock failures
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether rebuilding and retrying the unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Concurrency(_))
    }
}

impl From<ModelError> for StoreError {
    fn from(value: ModelError) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Schema-less document store.
///
/// ## Design Principles
///
/// - **Single-document atomicity** is the native guarantee; batches add
///   all-or-nothing semantics on top through etag checks
/// - **Optimistic locking** via [`ExpectedEtag`]; nothing ever blocks on a lock
///   held by another unit of work
/// - **No native TTL**: `expires_at` is plain metadata, removal happens only
///   through [`DocumentStore::purge_expired`]
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - reject a whole batch if any expectation fails (nothing partially applied)
/// - assign `sequence` monotonically on creation
/// - bump `etag` on every write, including increments
pub trait DocumentStore: Send + Sync {
    /// Create tables/indexes. Idempotent.
    fn setup(&self) -> Result<(), StoreError>;

    /// Remove every stored document. The schema created by
    /// [`DocumentStore::setup`] stays in place, so the store remains usable.
    fn destroy(&self) -> Result<(), StoreError>;

    /// Batch load by id; the result is positionally aligned with `ids`.
    fn load(&self, ids: &[DocumentId]) -> Result<Vec<Option<StoredDocument>>, StoreError>;

    fn query(&self, query: &DocumentQuery) -> Result<Vec<StoredDocument>, StoreError>;

    /// Number of documents matching the query's filters (skip/take ignored).
    fn count(&self, query: &DocumentQuery) -> Result<usize, StoreError>;

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Delete up to `limit` documents whose expiry is at or before `now`.
    fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, StoreError>;
}

impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn setup(&self) -> Result<(), StoreError> {
        (**self).setup()
    }

    fn destroy(&self) -> Result<(), StoreError> {
        (**self).destroy()
    }

    fn load(&self, ids: &[DocumentId]) -> Result<Vec<Option<StoredDocument>>, StoreError> {
        (**self).load(ids)
    }

    fn query(&self, query: &DocumentQuery) -> Result<Vec<StoredDocument>, StoreError> {
        (**self).query(query)
    }

    fn count(&self, query: &DocumentQuery) -> Result<usize, StoreError> {
        (**self).count(query)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }

    fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, StoreError> {
        (**self).purge_expired(now, limit)
    }
}
