//! Persistent job queues.
//!
//! - `provider`: queue traits, provider routing and `QueueError`
//! - `job_queue`: the document-backed queue (enqueue, blocking dequeue)
//! - `lease`: the fetched-job handle (acknowledge, abandon, requeue on drop)
//! - `monitoring`: queue listings and counts
//! - `signal`: wake-up signal and cancellation token

mod job_queue;
mod lease;
mod monitoring;
mod provider;
mod signal;

pub use job_queue::DocumentJobQueue;
pub use lease::DocumentFetchedJob;
pub use monitoring::{DocumentQueueMonitoringApi, DocumentQueueProvider};
pub use provider::{
    EnqueuedAndFetchedCount, FetchedJob, JobQueueProvider, PersistentJobQueue,
    PersistentJobQueueMonitoringApi, QueueError, QueueProviders,
};
pub use signal::{CancellationToken, QueueSignal};
