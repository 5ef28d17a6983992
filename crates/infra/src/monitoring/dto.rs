//! Read models returned by the monitoring API.
//!
//! Every listing carries `job: Option<Invocation>`; `None` means the stored
//! invocation could not be decoded, the rest of the row is still reported.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobdoc_core::{Invocation, JobId, StateHistoryEntry};

/// Page of jobs keyed by id, in listing order.
pub type JobList<T> = Vec<(JobId, T)>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsDto {
    pub servers: usize,
    pub queues: usize,
    pub recurring: usize,
    pub enqueued: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueuedJobDto {
    pub job: Option<Invocation>,
    pub state: Option<String>,
    /// Only set while the job is still in the Enqueued state.
    pub enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedJobDto {
    pub job: Option<Invocation>,
    pub state: Option<String>,
    /// Processing start time, when the job reached Processing.
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingJobDto {
    pub job: Option<Invocation>,
    pub server_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJobDto {
    pub job: Option<Invocation>,
    pub enqueue_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SucceededJobDto {
    pub job: Option<Invocation>,
    pub result: Option<String>,
    /// `PerformanceDuration + Latency` in milliseconds, when both are known.
    pub total_duration: Option<i64>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub in_succeeded_state: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedJobDto {
    pub job: Option<Invocation>,
    pub reason: Option<String>,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub exception_details: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedJobDto {
    pub job: Option<Invocation>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetailsDto {
    pub job: Option<Invocation>,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Most recent first.
    pub history: Vec<StateHistoryEntry>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueWithTopEnqueuedJobsDto {
    pub name: String,
    pub length: usize,
    pub fetched: usize,
    pub first_jobs: JobList<EnqueuedJobDto>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDto {
    pub name: String,
    pub heartbeat: DateTime<Utc>,
    pub queues: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub workers_count: u32,
}
