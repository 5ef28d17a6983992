use std::collections::BTreeSet;
use std::sync::Arc;

use jobdoc_core::{JobId, QueueEntry};

use crate::config::StorageOptions;
use crate::repository::Repository;
use crate::store::{DocumentQuery, StoreError};

use super::job_queue::DocumentJobQueue;
use super::provider::{
    EnqueuedAndFetchedCount, JobQueueProvider, PersistentJobQueue, PersistentJobQueueMonitoringApi,
};

/// Read-side view of the document queue.
#[derive(Debug, Clone)]
pub struct DocumentQueueMonitoringApi {
    repository: Repository,
}

impl DocumentQueueMonitoringApi {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    fn page(&self, query: DocumentQuery, from: usize, per_page: usize) -> Result<Vec<JobId>, StoreError> {
        let found = self
            .repository
            .open_session()
            .query::<QueueEntry>(&query.skip(from).take(per_page))?;
        Ok(found.into_iter().map(|(_, entry)| entry.job_id).collect())
    }
}

fn of_queue(queue: &str) -> DocumentQuery {
    DocumentQuery::of::<QueueEntry>().where_eq("queue", queue)
}

impl PersistentJobQueueMonitoringApi for DocumentQueueMonitoringApi {
    fn queues(&self) -> Result<Vec<String>, StoreError> {
        let all = self
            .repository
            .open_session()
            .query::<QueueEntry>(&DocumentQuery::of::<QueueEntry>())?;
        let names: BTreeSet<String> = all.into_iter().map(|(_, e)| e.queue).collect();
        Ok(names.into_iter().collect())
    }

    fn enqueued_job_ids(&self, queue: &str, from: usize, per_page: usize) -> Result<Vec<JobId>, StoreError> {
        self.page(of_queue(queue).where_null("fetched_at"), from, per_page)
    }

    fn fetched_job_ids(&self, queue: &str, from: usize, per_page: usize) -> Result<Vec<JobId>, StoreError> {
        self.page(of_queue(queue).where_not_null("fetched_at"), from, per_page)
    }

    fn enqueued_and_fetched_count(&self, queue: &str) -> Result<EnqueuedAndFetchedCount, StoreError> {
        let store = self.repository.store();
        Ok(EnqueuedAndFetchedCount {
            enqueued: store.count(&of_queue(queue).where_null("fetched_at"))?,
            fetched: store.count(&of_queue(queue).where_not_null("fetched_at"))?,
        })
    }
}

/// Provider pairing [`DocumentJobQueue`] with [`DocumentQueueMonitoringApi`].
#[derive(Debug, Clone)]
pub struct DocumentQueueProvider {
    queue: Arc<DocumentJobQueue>,
    monitoring: Arc<DocumentQueueMonitoringApi>,
}

impl DocumentQueueProvider {
    pub fn new(repository: Repository, options: &StorageOptions) -> Self {
        Self {
            queue: Arc::new(DocumentJobQueue::new(repository.clone(), options)),
            monitoring: Arc::new(DocumentQueueMonitoringApi::new(repository)),
        }
    }

    pub fn document_queue(&self) -> &Arc<DocumentJobQueue> {
        &self.queue
    }
}

impl JobQueueProvider for DocumentQueueProvider {
    fn job_queue(&self) -> Arc<dyn PersistentJobQueue> {
        self.queue.clone()
    }

    fn monitoring_api(&self) -> Arc<dyn PersistentJobQueueMonitoringApi> {
        self.monitoring.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{CancellationToken, FetchedJob, QueueProviders};
    use crate::store::InMemoryDocumentStore;

    fn provider() -> DocumentQueueProvider {
        let repo = Repository::new(InMemoryDocumentStore::new());
        DocumentQueueProvider::new(repo, &StorageOptions::default())
    }

    #[test]
    fn counts_and_pages_split_enqueued_from_fetched() {
        let provider = provider();
        let queue = provider.document_queue();
        for id in ["1", "2", "3"] {
            queue.enqueue("default", &JobId::from(id)).unwrap();
        }
        queue.enqueue("critical", &JobId::from("4")).unwrap();

        let mut lease = queue.dequeue_lease(&["default"], &CancellationToken::new()).unwrap();
        assert_eq!(lease.job_id().as_str(), "1");

        let api = provider.monitoring_api();
        assert_eq!(api.queues().unwrap(), vec!["critical".to_string(), "default".to_string()]);
        assert_eq!(
            api.enqueued_and_fetched_count("default").unwrap(),
            EnqueuedAndFetchedCount { enqueued: 2, fetched: 1 }
        );

        let enqueued: Vec<String> = api
            .enqueued_job_ids("default", 1, 10)
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(enqueued, vec!["3".to_string()]);
        assert_eq!(api.fetched_job_ids("default", 0, 10).unwrap(), vec![JobId::from("1")]);

        lease.acknowledge().unwrap();
    }

    #[test]
    fn providers_route_by_queue_name() {
        let default: Arc<dyn JobQueueProvider> = Arc::new(provider());
        let special: Arc<dyn JobQueueProvider> = Arc::new(provider());

        let mut providers = QueueProviders::new(default.clone());
        providers.add(special.clone(), &["reports", "exports"]);

        assert!(Arc::ptr_eq(providers.get_provider("reports"), &special));
        assert!(Arc::ptr_eq(providers.get_provider("default"), &default));
        assert_eq!(providers.providers().len(), 2);
    }
}
