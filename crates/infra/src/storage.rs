//! Job storage entry point: wires a document store, queue providers and the
//! read/write surfaces handed to the host framework.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, StorageOptions};
use crate::connection::StorageConnection;
use crate::expiration::ExpirationReaper;
use crate::monitoring::MonitoringApi;
use crate::queue::{DocumentQueueProvider, JobQueueProvider, QueueProviders};
use crate::repository::Repository;
use crate::store::{InMemoryDocumentStore, PostgresDocumentStore, StoreError};
use crate::transaction::WriteOnlyTransaction;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct JobStorage {
    repository: Repository,
    options: StorageOptions,
    default_queue: Arc<DocumentQueueProvider>,
    queue_providers: Arc<QueueProviders>,
}

impl JobStorage {
    /// Storage over an existing repository; the document queue serves every
    /// queue not routed elsewhere.
    pub fn new(repository: Repository, options: StorageOptions) -> Result<Self, StorageError> {
        options.validate()?;
        let default_queue = Arc::new(DocumentQueueProvider::new(repository.clone(), &options));
        let queue_providers = Arc::new(QueueProviders::new(default_queue.clone()));
        Ok(Self {
            repository,
            options,
            default_queue,
            queue_providers,
        })
    }

    pub fn in_memory(options: StorageOptions) -> Result<Self, StorageError> {
        Self::new(Repository::new(InMemoryDocumentStore::new()), options)
    }

    /// Postgres when `database_url` is set, in-memory otherwise. Runs schema
    /// setup before returning.
    pub fn open(options: StorageOptions) -> Result<Self, StorageError> {
        options.validate()?;
        let repository = match options.database_url.as_deref() {
            Some(url) => {
                let store = PostgresDocumentStore::connect(url, options.max_connections)?;
                info!(max_connections = options.max_connections, "using postgres document store");
                Repository::new(store)
            }
            None => {
                info!("using in-memory document store");
                Repository::new(InMemoryDocumentStore::new())
            }
        };
        repository.create()?;
        Self::new(repository, options)
    }

    /// Route `queues` to another provider.
    pub fn with_queue_provider(mut self, provider: Arc<dyn JobQueueProvider>, queues: &[&str]) -> Self {
        Arc::make_mut(&mut self.queue_providers).add(provider, queues);
        self
    }

    pub fn connection(&self) -> StorageConnection {
        StorageConnection::new(self.repository.clone(), self.queue_providers.clone())
    }

    pub fn create_write_transaction(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(self.repository.clone(), self.queue_providers.clone())
    }

    pub fn monitoring_api(&self) -> MonitoringApi {
        MonitoringApi::new(self.repository.clone(), self.queue_providers.clone())
    }

    pub fn expiration_reaper(&self) -> ExpirationReaper {
        ExpirationReaper::new(self.repository.clone(), &self.options)
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// The built-in document queue provider.
    pub fn default_queue(&self) -> &Arc<DocumentQueueProvider> {
        &self.default_queue
    }

    pub fn queue_providers(&self) -> &Arc<QueueProviders> {
        &self.queue_providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn invalid_options_are_rejected() {
        let options = StorageOptions::default().with_queue_poll_interval(Duration::ZERO);
        assert!(matches!(JobStorage::in_memory(options), Err(StorageError::Config(_))));
    }

    #[test]
    fn open_without_url_uses_memory() {
        let storage = JobStorage::open(StorageOptions::default()).unwrap();
        assert_eq!(storage.monitoring_api().get_statistics().unwrap().servers, 0);
    }

    #[test]
    fn extra_providers_are_routed() {
        let storage = JobStorage::in_memory(StorageOptions::default()).unwrap();
        let other: Arc<dyn JobQueueProvider> = Arc::new(DocumentQueueProvider::new(
            storage.repository().clone(),
            storage.options(),
        ));
        let storage = storage.with_queue_provider(other.clone(), &["reports"]);
        assert!(Arc::ptr_eq(storage.queue_providers().get_provider("reports"), &other));
    }
}
