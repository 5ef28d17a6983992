//! Unit-of-work session over a [`DocumentStore`].
//!
//! A session keeps an identity map of every document it touched together with
//! the etag it was loaded at. Nothing reaches the store until
//! [`DocumentSession::save_changes`], which sends one all-or-nothing batch:
//! document writes first (in first-touch order), then deferred patches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use jobdoc_core::{Document, DocumentId};

use crate::store::{DocumentQuery, DocumentStore, ExpectedEtag, StoreError, WriteBatch, WriteOp};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Status {
    Unchanged,
    Dirty,
    Deleted,
}

#[derive(Debug, Clone)]
struct Tracked {
    /// `None` when the document does not exist (yet).
    body: Option<JsonValue>,
    /// Etag observed in the store; `None` if it was absent at load time.
    etag: Option<u64>,
    /// Whether existence in the store is known (loaded or queried).
    known: bool,
    expires_at: Option<DateTime<Utc>>,
    status: Status,
}

/// Unit-of-work session.
pub struct DocumentSession {
    store: Arc<dyn DocumentStore>,
    tracked: HashMap<DocumentId, Tracked>,
    touch_order: Vec<DocumentId>,
    deferred: Vec<WriteOp>,
    optimistic: bool,
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("tracked", &self.tracked.len())
            .field("deferred", &self.deferred.len())
            .field("optimistic", &self.optimistic)
            .finish()
    }
}

impl DocumentSession {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            tracked: HashMap::new(),
            touch_order: Vec::new(),
            deferred: Vec::new(),
            optimistic: true,
        }
    }

    /// Toggle etag checks on save (enabled by default).
    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.optimistic = enabled;
        self
    }

    fn track(&mut self, id: DocumentId, tracked: Tracked) {
        if !self.tracked.contains_key(&id) {
            self.touch_order.push(id.clone());
        }
        self.tracked.insert(id, tracked);
    }

    fn ensure_loaded(&mut self, ids: &[DocumentId]) -> Result<(), StoreError> {
        let missing: Vec<DocumentId> = ids
            .iter()
            .filter(|id| !self.tracked.contains_key(*id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let loaded = self.store.load(&missing)?;
        for (id, doc) in missing.into_iter().zip(loaded) {
            let tracked = match doc {
                Some(doc) => Tracked {
                    body: Some(doc.body),
                    etag: Some(doc.etag),
                    known: true,
                    expires_at: doc.expires_at,
                    status: Status::Unchanged,
                },
                None => Tracked {
                    body: None,
                    etag: None,
                    known: true,
                    expires_at: None,
                    status: Status::Unchanged,
                },
            };
            self.track(id, tracked);
        }
        Ok(())
    }

    fn decode<T: Document>(id: &DocumentId, tracked: &Tracked) -> Result<Option<T>, StoreError> {
        match (&tracked.body, tracked.status) {
            (_, Status::Deleted) | (None, _) => Ok(None),
            (Some(body), _) => T::from_json(body.clone())
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("document '{id}': {e}"))),
        }
    }

    /// Load one document (from the identity map if already tracked).
    pub fn load<T: Document>(&mut self, id: &DocumentId) -> Result<Option<T>, StoreError> {
        self.ensure_loaded(std::slice::from_ref(id))?;
        match self.tracked.get(id) {
            Some(tracked) => Self::decode(id, tracked),
            None => Ok(None),
        }
    }

    /// Batch load; the result is positionally aligned with `ids`.
    pub fn load_many<T: Document>(&mut self, ids: &[DocumentId]) -> Result<Vec<Option<T>>, StoreError> {
        self.ensure_loaded(ids)?;
        ids.iter()
            .map(|id| match self.tracked.get(id) {
                Some(tracked) => Self::decode(id, tracked),
                None => Ok(None),
            })
            .collect()
    }

    /// Load the document, or register `T::default()` under `id` in this unit
    /// of work when it does not exist.
    pub fn load_or_default<T: Document + Default>(&mut self, id: &DocumentId) -> Result<T, StoreError> {
        if let Some(existing) = self.load::<T>(id)? {
            return Ok(existing);
        }
        let created = T::default();
        self.store(id, &created)?;
        Ok(created)
    }

    /// Run a query; results already tracked by this session are returned in
    /// their in-session form and documents deleted in this session are skipped.
    pub fn query<T: Document>(&mut self, query: &DocumentQuery) -> Result<Vec<(DocumentId, T)>, StoreError> {
        let found = self.store.query(query)?;
        let mut results = Vec::with_capacity(found.len());

        for doc in found {
            let id = doc.id.clone();
            if !self.tracked.contains_key(&id) {
                self.track(
                    id.clone(),
                    Tracked {
                        body: Some(doc.body),
                        etag: Some(doc.etag),
                        known: true,
                        expires_at: doc.expires_at,
                        status: Status::Unchanged,
                    },
                );
            }
            if let Some(tracked) = self.tracked.get(&id) {
                if let Some(decoded) = Self::decode::<T>(&id, tracked)? {
                    results.push((id, decoded));
                }
            }
        }
        Ok(results)
    }

    pub fn count(&self, query: &DocumentQuery) -> Result<usize, StoreError> {
        self.store.count(query)
    }

    /// Register a new or modified document.
    pub fn store<T: Document>(&mut self, id: &DocumentId, document: &T) -> Result<(), StoreError> {
        let body = document.to_json()?;
        match self.tracked.get_mut(id) {
            Some(tracked) => {
                tracked.body = Some(body);
                tracked.status = Status::Dirty;
            }
            None => self.track(
                id.clone(),
                Tracked {
                    body: Some(body),
                    etag: None,
                    known: false,
                    expires_at: None,
                    status: Status::Dirty,
                },
            ),
        }
        Ok(())
    }

    /// Mark a document for deletion (loaded or not).
    pub fn delete(&mut self, id: &DocumentId) {
        match self.tracked.get_mut(id) {
            Some(tracked) => {
                tracked.status = Status::Deleted;
            }
            None => self.track(
                id.clone(),
                Tracked {
                    body: None,
                    etag: None,
                    known: false,
                    expires_at: None,
                    status: Status::Deleted,
                },
            ),
        }
    }

    /// Whether saving this session would create `id` (it was absent when
    /// first touched).
    pub fn is_new(&self, id: &DocumentId) -> bool {
        self.tracked
            .get(id)
            .is_some_and(|t| t.etag.is_none() && t.body.is_some() && t.status != Status::Deleted)
    }

    pub fn get_expiry(&mut self, id: &DocumentId) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.ensure_loaded(std::slice::from_ref(id))?;
        Ok(self
            .tracked
            .get(id)
            .filter(|t| t.body.is_some() && t.status != Status::Deleted)
            .and_then(|t| t.expires_at))
    }

    fn update_expiry(
        &mut self,
        id: &DocumentId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.ensure_loaded(std::slice::from_ref(id))?;
        match self.tracked.get_mut(id) {
            Some(tracked) if tracked.body.is_some() && tracked.status != Status::Deleted => {
                tracked.expires_at = expires_at;
                tracked.status = Status::Dirty;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Attach an absolute expiration timestamp. Returns `false` when the
    /// document does not exist.
    pub fn set_expiry(&mut self, id: &DocumentId, expires_at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update_expiry(id, Some(expires_at))
    }

    /// Clear the expiration timestamp. Returns `false` when the document does
    /// not exist.
    pub fn remove_expiry(&mut self, id: &DocumentId) -> Result<bool, StoreError> {
        self.update_expiry(id, None)
    }

    /// Queue a server-side operation to run with the next save.
    pub fn defer(&mut self, op: WriteOp) {
        self.deferred.push(op);
    }

    pub fn has_changes(&self) -> bool {
        !self.deferred.is_empty() || self.tracked.values().any(|t| t.status != Status::Unchanged)
    }

    fn build_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::new();

        for id in &self.touch_order {
            let Some(tracked) = self.tracked.get(id) else {
                continue;
            };
            match tracked.status {
                Status::Unchanged => {}
                Status::Dirty => {
                    let Some(body) = tracked.body.clone() else {
                        continue;
                    };
                    let expected = match (self.optimistic, tracked.etag) {
                        (true, Some(etag)) => ExpectedEtag::Exact(etag),
                        (true, None) => ExpectedEtag::Absent,
                        (false, _) => ExpectedEtag::Any,
                    };
                    batch.push(WriteOp::Put {
                        id: id.clone(),
                        body,
                        expires_at: tracked.expires_at,
                        expected,
                    });
                }
                Status::Deleted => {
                    let expected = match (self.optimistic, tracked.known, tracked.etag) {
                        // Known to be absent in the store: nothing to delete.
                        (_, true, None) => continue,
                        (true, true, Some(etag)) => ExpectedEtag::Exact(etag),
                        _ => ExpectedEtag::Any,
                    };
                    batch.push(WriteOp::Delete {
                        id: id.clone(),
                        expected,
                    });
                }
            }
        }

        for op in &self.deferred {
            batch.push(op.clone());
        }
        batch
    }

    /// Send every change as one batch. On success the identity map is
    /// cleared; on failure nothing was applied and the session keeps its
    /// pending changes.
    pub fn save_changes(&mut self) -> Result<(), StoreError> {
        let batch = self.build_batch();
        if batch.is_empty() {
            return Ok(());
        }

        let ops = batch.len();
        self.store.commit(batch)?;
        debug!(ops, "session changes saved");

        self.tracked.clear();
        self.touch_order.clear();
        self.deferred.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use jobdoc_core::{HashDocument, SetDocument};

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(InMemoryDocumentStore::new())
    }

    #[test]
    fn load_or_default_registers_new_document() {
        let store = store();
        let id = SetDocument::id_for("tags");

        let mut session = DocumentSession::new(store.clone());
        let mut set: SetDocument = session.load_or_default(&id).unwrap();
        assert!(session.is_new(&id));
        set.scores.insert("a".to_string(), 1.0);
        session.store(&id, &set).unwrap();
        session.save_changes().unwrap();

        let mut reader = DocumentSession::new(store);
        let loaded: SetDocument = reader.load(&id).unwrap().unwrap();
        assert_eq!(loaded.scores.len(), 1);
        assert!(!reader.is_new(&id));
    }

    #[test]
    fn concurrent_sessions_conflict_on_same_document() {
        let store = store();
        let id = HashDocument::id_for("h");

        let mut seed = DocumentSession::new(store.clone());
        seed.store(&id, &HashDocument::default()).unwrap();
        seed.save_changes().unwrap();

        let mut first = DocumentSession::new(store.clone());
        let mut second = DocumentSession::new(store.clone());
        let mut a: HashDocument = first.load(&id).unwrap().unwrap();
        let mut b: HashDocument = second.load(&id).unwrap().unwrap();

        a.fields.insert("k".into(), "first".into());
        b.fields.insert("k".into(), "second".into());
        first.store(&id, &a).unwrap();
        second.store(&id, &b).unwrap();

        first.save_changes().unwrap();
        let err = second.save_changes().unwrap_err();
        assert!(err.is_retryable());

        let mut reader = DocumentSession::new(store);
        let stored: HashDocument = reader.load(&id).unwrap().unwrap();
        assert_eq!(stored.fields.get("k").map(String::as_str), Some("first"));
    }

    #[test]
    fn deleting_unsaved_document_writes_nothing() {
        let store = store();
        let id = SetDocument::id_for("temp");

        let mut session = DocumentSession::new(store.clone());
        let _: SetDocument = session.load_or_default(&id).unwrap();
        session.delete(&id);
        assert!(session.build_batch().is_empty());
        session.save_changes().unwrap();

        assert_eq!(store.count(&DocumentQuery::of::<SetDocument>()).unwrap(), 0);
    }

    #[test]
    fn expiry_is_tracked_per_document() {
        let store = store();
        let id = HashDocument::id_for("h");
        let at = Utc::now() + chrono::Duration::hours(1);

        let mut session = DocumentSession::new(store.clone());
        assert!(!session.set_expiry(&id, at).unwrap());
        session.store(&id, &HashDocument::default()).unwrap();
        assert!(session.set_expiry(&id, at).unwrap());
        session.save_changes().unwrap();

        let mut reader = DocumentSession::new(store.clone());
        assert_eq!(reader.get_expiry(&id).unwrap(), Some(at));
        assert!(reader.remove_expiry(&id).unwrap());
        reader.save_changes().unwrap();

        let mut again = DocumentSession::new(store);
        assert_eq!(again.get_expiry(&id).unwrap(), None);
    }

    #[test]
    fn query_prefers_in_session_state() {
        let store = store();
        let id = SetDocument::id_for("s");
        let mut seed = DocumentSession::new(store.clone());
        seed.store(&id, &SetDocument::default()).unwrap();
        seed.save_changes().unwrap();

        let mut session = DocumentSession::new(store);
        let _: Option<SetDocument> = session.load(&id).unwrap();
        session.delete(&id);

        let found: Vec<(DocumentId, SetDocument)> =
            session.query(&DocumentQuery::of::<SetDocument>()).unwrap();
        assert!(found.is_empty());
    }
}
