use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use jobdoc_core::JobId;

use crate::session::DocumentSession;
use crate::store::StoreError;

use super::signal::CancellationToken;

/// Queue operation error.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The cancellation token fired while waiting; the normal worker
    /// shutdown path.
    #[error("dequeue cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

/// A leased queue entry.
///
/// Exactly one of [`acknowledge`](Self::acknowledge) or
/// [`abandon`](Self::abandon) should be called; implementations abandon on
/// drop when neither was, so a crashing worker never loses the job.
pub trait FetchedJob: Send + std::fmt::Debug {
    fn job_id(&self) -> &JobId;

    fn queue(&self) -> &str;

    /// Remove the entry: the job has been handed over to processing.
    fn acknowledge(&mut self) -> Result<(), StoreError>;

    /// Make the entry visible to other consumers again.
    fn abandon(&mut self) -> Result<(), StoreError>;
}

/// A persistent queue implementation.
pub trait PersistentJobQueue: Send + Sync {
    /// Register a new entry inside the caller's unit of work.
    fn enqueue_in(
        &self,
        session: &mut DocumentSession,
        queue: &str,
        job_id: &JobId,
    ) -> Result<(), StoreError>;

    /// Block until an entry of one of `queues` is leased or `token` fires.
    fn dequeue(
        &self,
        queues: &[&str],
        token: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>, QueueError>;

    /// Called after a commit that enqueued entries has succeeded.
    fn notify_enqueued(&self) {}
}

/// Enqueued/fetched totals of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueuedAndFetchedCount {
    pub enqueued: usize,
    pub fetched: usize,
}

/// Counting strategy of a queue implementation, used by monitoring.
pub trait PersistentJobQueueMonitoringApi: Send + Sync {
    fn queues(&self) -> Result<Vec<String>, StoreError>;

    fn enqueued_job_ids(&self, queue: &str, from: usize, per_page: usize) -> Result<Vec<JobId>, StoreError>;

    fn fetched_job_ids(&self, queue: &str, from: usize, per_page: usize) -> Result<Vec<JobId>, StoreError>;

    fn enqueued_and_fetched_count(&self, queue: &str) -> Result<EnqueuedAndFetchedCount, StoreError>;
}

/// Pairs a queue implementation with its monitoring view.
pub trait JobQueueProvider: Send + Sync {
    fn job_queue(&self) -> Arc<dyn PersistentJobQueue>;

    fn monitoring_api(&self) -> Arc<dyn PersistentJobQueueMonitoringApi>;
}

/// Routes queue names to providers, falling back to a default one.
#[derive(Clone)]
pub struct QueueProviders {
    default: Arc<dyn JobQueueProvider>,
    by_queue: HashMap<String, Arc<dyn JobQueueProvider>>,
}

impl std::fmt::Debug for QueueProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut queues: Vec<&String> = self.by_queue.keys().collect();
        queues.sort();
        f.debug_struct("QueueProviders")
            .field("routed_queues", &queues)
            .finish_non_exhaustive()
    }
}

impl QueueProviders {
    pub fn new(default: Arc<dyn JobQueueProvider>) -> Self {
        Self {
            default,
            by_queue: HashMap::new(),
        }
    }

    /// Route `queues` to `provider`.
    pub fn add(&mut self, provider: Arc<dyn JobQueueProvider>, queues: &[&str]) {
        for queue in queues {
            self.by_queue.insert((*queue).to_string(), provider.clone());
        }
    }

    pub fn get_provider(&self, queue: &str) -> &Arc<dyn JobQueueProvider> {
        self.by_queue.get(queue).unwrap_or(&self.default)
    }

    /// Every distinct provider (default first).
    pub fn providers(&self) -> Vec<Arc<dyn JobQueueProvider>> {
        let mut distinct: Vec<Arc<dyn JobQueueProvider>> = vec![self.default.clone()];
        for provider in self.by_queue.values() {
            if !distinct.iter().any(|p| Arc::ptr_eq(p, provider)) {
                distinct.push(provider.clone());
            }
        }
        distinct
    }
}
