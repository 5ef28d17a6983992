use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobdoc_core::DocumentId;

use super::query::DocumentQuery;
use super::r#trait::{DocumentStore, StoreError, StoredDocument, WriteBatch, WriteOp};

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<DocumentId, StoredDocument>,
    next_sequence: u64,
}

/// In-memory document store.
///
/// Intended for tests/dev. Queries are full scans.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<Inner>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents (all collections).
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.documents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

fn increment_field(body: &mut JsonValue, field: &str, delta: i64) -> Result<(), StoreError> {
    let object = body
        .as_object_mut()
        .ok_or_else(|| StoreError::Serialization("increment target is not an object".into()))?;
    let current = match object.get(field) {
        None | Some(JsonValue::Null) => 0,
        Some(value) => value.as_i64().ok_or_else(|| {
            StoreError::Serialization(format!("field '{field}' is not an integer"))
        })?,
    };
    object.insert(field.to_string(), JsonValue::from(current + delta));
    Ok(())
}

impl DocumentStore for InMemoryDocumentStore {
    fn setup(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn destroy(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.documents.clear();
        Ok(())
    }

    fn load(&self, ids: &[DocumentId]) -> Result<Vec<Option<StoredDocument>>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(ids.iter().map(|id| inner.documents.get(id).cloned()).collect())
    }

    fn query(&self, query: &DocumentQuery) -> Result<Vec<StoredDocument>, StoreError> {
        query.validate()?;
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let matching: Vec<StoredDocument> = inner
            .documents
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        Ok(query.finish(matching))
    }

    fn count(&self, query: &DocumentQuery) -> Result<usize, StoreError> {
        query.validate()?;
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.documents.values().filter(|d| query.matches(d)).count())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().map_err(|_| poisoned())?;

        // Stage every touched document; nothing reaches the map unless the
        // whole batch applies cleanly.
        let mut staged: HashMap<DocumentId, Option<StoredDocument>> = HashMap::new();
        let mut next_sequence = inner.next_sequence;

        for op in batch.into_ops() {
            let id = op.id().clone();
            let current = match staged.get(&id) {
                Some(doc) => doc.clone(),
                None => inner.documents.get(&id).cloned(),
            };

            let updated = match op {
                WriteOp::Put {
                    id,
                    body,
                    expires_at,
                    expected,
                } => {
                    if !expected.matches(current.as_ref().map(|d| d.etag)) {
                        return Err(StoreError::Concurrency(format!(
                            "put '{id}': expected {expected:?}, found {:?}",
                            current.as_ref().map(|d| d.etag)
                        )));
                    }
                    Some(match current {
                        Some(existing) => StoredDocument {
                            body,
                            etag: existing.etag + 1,
                            expires_at,
                            ..existing
                        },
                        None => {
                            next_sequence += 1;
                            StoredDocument {
                                id,
                                body,
                                etag: 1,
                                sequence: next_sequence,
                                expires_at,
                            }
                        }
                    })
                }
                WriteOp::Delete { id, expected } => {
                    if !expected.matches(current.as_ref().map(|d| d.etag)) {
                        return Err(StoreError::Concurrency(format!(
                            "delete '{id}': expected {expected:?}, found {:?}",
                            current.as_ref().map(|d| d.etag)
                        )));
                    }
                    None
                }
                WriteOp::Increment {
                    id,
                    field,
                    delta,
                    expires_at,
                } => Some(match current {
                    Some(mut existing) => {
                        increment_field(&mut existing.body, &field, delta)?;
                        existing.etag += 1;
                        if expires_at.is_some() {
                            existing.expires_at = expires_at;
                        }
                        existing
                    }
                    None => {
                        next_sequence += 1;
                        let mut body = JsonValue::Object(Default::default());
                        increment_field(&mut body, &field, delta)?;
                        StoredDocument {
                            id,
                            body,
                            etag: 1,
                            sequence: next_sequence,
                            expires_at,
                        }
                    }
                }),
            };

            staged.insert(id, updated);
        }

        for (id, doc) in staged {
            match doc {
                Some(doc) => {
                    inner.documents.insert(id, doc);
                }
                None => {
                    inner.documents.remove(&id);
                }
            }
        }
        inner.next_sequence = next_sequence;

        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let expired: Vec<DocumentId> = inner
            .documents
            .values()
            .filter(|d| d.expires_at.is_some_and(|at| at <= now))
            .map(|d| d.id.clone())
            .take(limit)
            .collect();

        for id in &expired {
            inner.documents.remove(id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExpectedEtag;
    use serde_json::json;

    fn put(key: &str, body: JsonValue, expected: ExpectedEtag) -> WriteOp {
        WriteOp::Put {
            id: DocumentId::new("sets", key),
            body,
            expires_at: None,
            expected,
        }
    }

    fn commit_one(store: &InMemoryDocumentStore, op: WriteOp) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.push(op);
        store.commit(batch)
    }

    #[test]
    fn put_assigns_etag_and_sequence() {
        let store = InMemoryDocumentStore::new();
        commit_one(&store, put("a", json!({"n": 1}), ExpectedEtag::Absent)).unwrap();
        commit_one(&store, put("b", json!({"n": 2}), ExpectedEtag::Absent)).unwrap();

        let loaded = store
            .load(&[DocumentId::new("sets", "a"), DocumentId::new("sets", "b")])
            .unwrap();
        let a = loaded[0].as_ref().unwrap();
        let b = loaded[1].as_ref().unwrap();
        assert_eq!(a.etag, 1);
        assert!(a.sequence < b.sequence);

        commit_one(&store, put("a", json!({"n": 3}), ExpectedEtag::Exact(1))).unwrap();
        let a = store.load(&[DocumentId::new("sets", "a")]).unwrap().remove(0).unwrap();
        assert_eq!(a.etag, 2);
        assert_eq!(a.sequence, 1);
        assert_eq!(a.body, json!({"n": 3}));
    }

    #[test]
    fn stale_etag_rejects_whole_batch() {
        let store = InMemoryDocumentStore::new();
        commit_one(&store, put("a", json!({}), ExpectedEtag::Absent)).unwrap();

        let mut batch = WriteBatch::new();
        batch.push(put("b", json!({}), ExpectedEtag::Absent));
        batch.push(put("a", json!({"x": 1}), ExpectedEtag::Exact(99)));
        let err = store.commit(batch).unwrap_err();
        assert!(err.is_retryable());

        // "b" was staged before the failing op and must not be visible.
        assert!(store.load(&[DocumentId::new("sets", "b")]).unwrap()[0].is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn increment_creates_then_adds() {
        let store = InMemoryDocumentStore::new();
        let id = DocumentId::new("counters", "hits");
        for _ in 0..3 {
            commit_one(
                &store,
                WriteOp::Increment {
                    id: id.clone(),
                    field: "value".to_string(),
                    delta: 2,
                    expires_at: None,
                },
            )
            .unwrap();
        }

        let doc = store.load(&[id]).unwrap().remove(0).unwrap();
        assert_eq!(doc.body, json!({"value": 6}));
        assert_eq!(doc.etag, 3);
    }

    #[test]
    fn purge_removes_only_expired() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Put {
            id: DocumentId::new("lists", "old"),
            body: json!({}),
            expires_at: Some(now - chrono::Duration::seconds(1)),
            expected: ExpectedEtag::Any,
        });
        batch.push(WriteOp::Put {
            id: DocumentId::new("lists", "fresh"),
            body: json!({}),
            expires_at: Some(now + chrono::Duration::hours(1)),
            expected: ExpectedEtag::Any,
        });
        batch.push(put("forever", json!({}), ExpectedEtag::Any));
        store.commit(batch).unwrap();

        assert_eq!(store.purge_expired(now, 100).unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.load(&[DocumentId::new("lists", "old")]).unwrap()[0].is_none());
    }

    #[test]
    fn destroy_empties_but_keeps_store_usable() {
        let store = InMemoryDocumentStore::new();
        commit_one(&store, put("a", json!({}), ExpectedEtag::Absent)).unwrap();

        store.destroy().unwrap();
        assert!(store.is_empty());

        commit_one(&store, put("a", json!({}), ExpectedEtag::Absent)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_missing_with_any_is_noop() {
        let store = InMemoryDocumentStore::new();
        commit_one(
            &store,
            WriteOp::Delete {
                id: DocumentId::new("sets", "ghost"),
                expected: ExpectedEtag::Any,
            },
        )
        .unwrap();

        let err = commit_one(
            &store,
            WriteOp::Delete {
                id: DocumentId::new("sets", "ghost"),
                expected: ExpectedEtag::Exact(1),
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
    }
}
