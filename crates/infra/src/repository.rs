//! Repository: session factory and identifier conventions.

use std::sync::Arc;

use tracing::info;

use jobdoc_core::{Document, DocumentId};

use crate::session::DocumentSession;
use crate::store::{DocumentStore, StoreError};

/// Owns the document store handle shared by every component.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    pub fn new<S: DocumentStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_arc(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Create tables and indexes.
    pub fn create(&self) -> Result<(), StoreError> {
        self.store.setup()?;
        info!("document store schema ready");
        Ok(())
    }

    /// Remove every stored document.
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.store.destroy()?;
        info!("document store destroyed");
        Ok(())
    }

    /// Open a new unit of work.
    pub fn open_session(&self) -> DocumentSession {
        DocumentSession::new(self.store.clone())
    }

    /// Id of the `T` document addressed by the given key parts.
    pub fn id_for<T: Document>(&self, key: &[&str]) -> DocumentId {
        DocumentId::from_parts(T::COLLECTION, key)
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use jobdoc_core::{CounterDocument, JobDocument};

    #[test]
    fn ids_combine_collection_and_key() {
        let repo = Repository::new(InMemoryDocumentStore::new());
        assert_eq!(repo.id_for::<JobDocument>(&["42"]).to_string(), "jobs/42");
        assert_eq!(
            repo.id_for::<CounterDocument>(&["stats:succeeded"]).to_string(),
            "counters/stats:succeeded"
        );
    }

    #[test]
    fn destroy_clears_documents() {
        let repo = Repository::new(InMemoryDocumentStore::new());
        repo.create().unwrap();

        let id = repo.id_for::<CounterDocument>(&["c"]);
        let mut session = repo.open_session();
        session.store(&id, &CounterDocument { value: 1 }).unwrap();
        session.save_changes().unwrap();

        repo.destroy().unwrap();
        let mut session = repo.open_session();
        assert!(session.load::<CounterDocument>(&id).unwrap().is_none());
    }
}
