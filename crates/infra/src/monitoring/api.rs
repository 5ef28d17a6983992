use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, TimeDelta, Timelike, Utc};
use tracing::debug;

use jobdoc_core::{
    CounterDocument, Document, Invocation, JobDocument, JobId, ServerDocument, SetDocument,
    StateData, state_names,
};

use crate::queue::{JobQueueProvider, PersistentJobQueueMonitoringApi, QueueProviders};
use crate::repository::Repository;
use crate::store::{DocumentQuery, Order, StoreError};

use super::dto::*;

/// Set holding the ids of recurring jobs.
pub const RECURRING_JOBS_SET: &str = "recurring-jobs";

const FIRST_JOBS_PER_QUEUE: usize = 5;

/// Counter key of a day bucket: `stats:<type>:<yyyy-MM-dd>`.
pub fn daily_stats_key(kind: &str, day: NaiveDate) -> String {
    format!("stats:{kind}:{}", day.format("%Y-%m-%d"))
}

/// Counter key of an hour bucket: `stats:<type>:<yyyy-MM-dd-HH>`.
pub fn hourly_stats_key(kind: &str, hour: DateTime<Utc>) -> String {
    format!("stats:{kind}:{}", hour.format("%Y-%m-%d-%H"))
}

/// Timestamps stored in state data: RFC 3339 or unix milliseconds.
fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

fn decode_invocation(job_id: &str, job: &JobDocument) -> Option<Invocation> {
    match job.invocation_data.deserialize() {
        Ok(invocation) => Some(invocation),
        Err(e) => {
            debug!(job_id, error = %e, "job invocation could not be decoded");
            None
        }
    }
}

/// Read-only view over jobs, queues, servers and statistics.
#[derive(Debug, Clone)]
pub struct MonitoringApi {
    repository: Repository,
    queue_providers: Arc<QueueProviders>,
}

impl MonitoringApi {
    pub fn new(repository: Repository, queue_providers: Arc<QueueProviders>) -> Self {
        Self {
            repository,
            queue_providers,
        }
    }

    fn queue_api(&self, queue: &str) -> Arc<dyn PersistentJobQueueMonitoringApi> {
        self.queue_providers.get_provider(queue).monitoring_api()
    }

    fn count_in_state(&self, state: &str) -> Result<usize, StoreError> {
        self.repository
            .store()
            .count(&DocumentQuery::of::<JobDocument>().where_eq("state.name", state))
    }

    fn queue_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = BTreeSet::new();
        for provider in self.queue_providers.providers() {
            names.extend(provider.monitoring_api().queues()?);
        }
        Ok(names)
    }

    // Statistics

    pub fn get_statistics(&self) -> Result<StatisticsDto, StoreError> {
        let servers = self
            .repository
            .store()
            .count(&DocumentQuery::of::<ServerDocument>())?;
        let recurring = self
            .repository
            .open_session()
            .load::<SetDocument>(&SetDocument::id_for(RECURRING_JOBS_SET))?
            .map(|s| s.scores.len())
            .unwrap_or(0);

        Ok(StatisticsDto {
            servers,
            queues: self.queue_names()?.len(),
            recurring,
            enqueued: self.count_in_state(state_names::ENQUEUED)?,
            scheduled: self.count_in_state(state_names::SCHEDULED)?,
            processing: self.count_in_state(state_names::PROCESSING)?,
            succeeded: self.count_in_state(state_names::SUCCEEDED)?,
            failed: self.count_in_state(state_names::FAILED)?,
            deleted: self.count_in_state(state_names::DELETED)?,
        })
    }

    pub fn enqueued_count(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self.queue_api(queue).enqueued_and_fetched_count(queue)?.enqueued)
    }

    pub fn fetched_count(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self.queue_api(queue).enqueued_and_fetched_count(queue)?.fetched)
    }

    pub fn scheduled_count(&self) -> Result<usize, StoreError> {
        self.count_in_state(state_names::SCHEDULED)
    }

    pub fn processing_count(&self) -> Result<usize, StoreError> {
        self.count_in_state(state_names::PROCESSING)
    }

    pub fn failed_count(&self) -> Result<usize, StoreError> {
        self.count_in_state(state_names::FAILED)
    }

    pub fn succeeded_list_count(&self) -> Result<usize, StoreError> {
        self.count_in_state(state_names::SUCCEEDED)
    }

    pub fn deleted_list_count(&self) -> Result<usize, StoreError> {
        self.count_in_state(state_names::DELETED)
    }

    // Time-bucketed counters

    pub fn succeeded_by_dates_count(&self) -> Result<BTreeMap<NaiveDate, i64>, StoreError> {
        self.daily_timeline("succeeded")
    }

    pub fn failed_by_dates_count(&self) -> Result<BTreeMap<NaiveDate, i64>, StoreError> {
        self.daily_timeline("failed")
    }

    pub fn hourly_succeeded_jobs(&self) -> Result<BTreeMap<DateTime<Utc>, i64>, StoreError> {
        self.hourly_timeline("succeeded")
    }

    pub fn hourly_failed_jobs(&self) -> Result<BTreeMap<DateTime<Utc>, i64>, StoreError> {
        self.hourly_timeline("failed")
    }

    /// Today and the six days before it.
    fn daily_timeline(&self, kind: &str) -> Result<BTreeMap<NaiveDate, i64>, StoreError> {
        let today = Utc::now().date_naive();
        let days: Vec<NaiveDate> = (0..7u64).filter_map(|i| today.checked_sub_days(Days::new(i))).collect();
        let keys: Vec<String> = days.iter().map(|d| daily_stats_key(kind, *d)).collect();
        Ok(days.into_iter().zip(self.counter_values(&keys)?).collect())
    }

    /// The current hour and the 23 hours before it.
    fn hourly_timeline(&self, kind: &str) -> Result<BTreeMap<DateTime<Utc>, i64>, StoreError> {
        let now = Utc::now();
        let current = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let hours: Vec<DateTime<Utc>> = (0..24).map(|i| current - TimeDelta::hours(i)).collect();
        let keys: Vec<String> = hours.iter().map(|h| hourly_stats_key(kind, *h)).collect();
        Ok(hours.into_iter().zip(self.counter_values(&keys)?).collect())
    }

    fn counter_values(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        let ids: Vec<_> = keys.iter().map(|k| CounterDocument::id_for(k)).collect();
        let counters = self.repository.open_session().load_many::<CounterDocument>(&ids)?;
        Ok(counters.into_iter().map(|c| c.map(|c| c.value).unwrap_or(0)).collect())
    }

    // Listings

    fn jobs_in_state<T, F>(&self, state: &str, from: usize, count: usize, map: F) -> Result<JobList<T>, StoreError>
    where
        F: Fn(&JobDocument, Option<Invocation>, &StateData) -> T,
    {
        let query = DocumentQuery::of::<JobDocument>()
            .where_eq("state.name", state)
            .order(Order::ArrivalDesc)
            .skip(from)
            .take(count);
        let jobs = self.repository.open_session().query::<JobDocument>(&query)?;

        Ok(jobs
            .into_iter()
            .map(|(id, job)| {
                let invocation = decode_invocation(id.key(), &job);
                let state = job.state.clone().unwrap_or_default();
                (JobId::from(id.key()), map(&job, invocation, &state))
            })
            .collect())
    }

    fn jobs_by_id<T, F>(&self, job_ids: &[JobId], map: F) -> Result<JobList<T>, StoreError>
    where
        F: Fn(&JobDocument, Option<Invocation>, &StateData) -> T,
    {
        let ids: Vec<_> = job_ids.iter().map(|j| JobDocument::id_for(j.as_str())).collect();
        let jobs = self.repository.open_session().load_many::<JobDocument>(&ids)?;

        Ok(job_ids
            .iter()
            .zip(jobs)
            .filter_map(|(job_id, job)| job.map(|job| (job_id, job)))
            .map(|(job_id, job)| {
                let invocation = decode_invocation(job_id.as_str(), &job);
                let state = job.state.clone().unwrap_or_default();
                (job_id.clone(), map(&job, invocation, &state))
            })
            .collect())
    }

    fn enqueued_dtos(&self, job_ids: &[JobId]) -> Result<JobList<EnqueuedJobDto>, StoreError> {
        self.jobs_by_id(job_ids, |job, invocation, state| EnqueuedJobDto {
            job: invocation,
            state: job.state_name().map(str::to_string),
            enqueued_at: if job.state_name() == Some(state_names::ENQUEUED) {
                parse_timestamp(state.get("EnqueuedAt"))
            } else {
                None
            },
        })
    }

    pub fn enqueued_jobs(&self, queue: &str, from: usize, per_page: usize) -> Result<JobList<EnqueuedJobDto>, StoreError> {
        let ids = self.queue_api(queue).enqueued_job_ids(queue, from, per_page)?;
        self.enqueued_dtos(&ids)
    }

    pub fn fetched_jobs(&self, queue: &str, from: usize, per_page: usize) -> Result<JobList<FetchedJobDto>, StoreError> {
        let ids = self.queue_api(queue).fetched_job_ids(queue, from, per_page)?;
        self.jobs_by_id(&ids, |job, invocation, state| FetchedJobDto {
            job: invocation,
            state: job.state_name().map(str::to_string),
            fetched_at: if job.state_name() == Some(state_names::PROCESSING) {
                parse_timestamp(state.get("StartedAt"))
            } else {
                None
            },
        })
    }

    pub fn processing_jobs(&self, from: usize, count: usize) -> Result<JobList<ProcessingJobDto>, StoreError> {
        self.jobs_in_state(state_names::PROCESSING, from, count, |_, invocation, state| ProcessingJobDto {
            job: invocation,
            server_id: state.get("ServerId").or_else(|| state.get("ServerName")).map(str::to_string),
            started_at: parse_timestamp(state.get("StartedAt")),
        })
    }

    pub fn scheduled_jobs(&self, from: usize, count: usize) -> Result<JobList<ScheduledJobDto>, StoreError> {
        self.jobs_in_state(state_names::SCHEDULED, from, count, |_, invocation, state| ScheduledJobDto {
            job: invocation,
            enqueue_at: parse_timestamp(state.get("EnqueueAt")),
            scheduled_at: parse_timestamp(state.get("ScheduledAt")),
        })
    }

    pub fn succeeded_jobs(&self, from: usize, count: usize) -> Result<JobList<SucceededJobDto>, StoreError> {
        self.jobs_in_state(state_names::SUCCEEDED, from, count, |_, invocation, state| {
            let duration = state.get("PerformanceDuration").and_then(|v| v.parse::<i64>().ok());
            let latency = state.get("Latency").and_then(|v| v.parse::<i64>().ok());
            SucceededJobDto {
                job: invocation,
                result: state.get("Result").map(str::to_string),
                total_duration: duration.zip(latency).map(|(d, l)| d + l),
                succeeded_at: parse_timestamp(state.get("SucceededAt")),
                in_succeeded_state: true,
            }
        })
    }

    pub fn failed_jobs(&self, from: usize, count: usize) -> Result<JobList<FailedJobDto>, StoreError> {
        self.jobs_in_state(state_names::FAILED, from, count, |_, invocation, state| FailedJobDto {
            job: invocation,
            reason: state.reason.clone(),
            exception_type: state.get("ExceptionType").map(str::to_string),
            exception_message: state.get("ExceptionMessage").map(str::to_string),
            exception_details: state.get("ExceptionDetails").map(str::to_string),
            failed_at: parse_timestamp(state.get("FailedAt")),
        })
    }

    pub fn deleted_jobs(&self, from: usize, count: usize) -> Result<JobList<DeletedJobDto>, StoreError> {
        self.jobs_in_state(state_names::DELETED, from, count, |_, invocation, state| DeletedJobDto {
            job: invocation,
            deleted_at: parse_timestamp(state.get("DeletedAt")),
        })
    }

    pub fn job_details(&self, job_id: &JobId) -> Result<Option<JobDetailsDto>, StoreError> {
        let id = JobDocument::id_for(job_id.as_str());
        let mut session = self.repository.open_session();
        let Some(job) = session.load::<JobDocument>(&id)? else {
            return Ok(None);
        };
        let expire_at = session.get_expiry(&id)?;

        Ok(Some(JobDetailsDto {
            job: decode_invocation(job_id.as_str(), &job),
            created_at: job.created_at,
            expire_at,
            history: job.history,
            properties: job.parameters,
        }))
    }

    // Inventories

    pub fn queues(&self) -> Result<Vec<QueueWithTopEnqueuedJobsDto>, StoreError> {
        let mut result = Vec::new();
        for name in self.queue_names()? {
            let api = self.queue_api(&name);
            let counts = api.enqueued_and_fetched_count(&name)?;
            let first_ids = api.enqueued_job_ids(&name, 0, FIRST_JOBS_PER_QUEUE)?;
            result.push(QueueWithTopEnqueuedJobsDto {
                first_jobs: self.enqueued_dtos(&first_ids)?,
                name,
                length: counts.enqueued,
                fetched: counts.fetched,
            });
        }
        Ok(result)
    }

    pub fn servers(&self) -> Result<Vec<ServerDto>, StoreError> {
        let servers = self
            .repository
            .open_session()
            .query::<ServerDocument>(&DocumentQuery::of::<ServerDocument>())?;

        Ok(servers
            .into_iter()
            .map(|(id, server)| ServerDto {
                name: id.key().to_string(),
                heartbeat: server.last_heartbeat,
                queues: server.data.queues,
                started_at: server.data.started_at,
                workers_count: server.data.worker_count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_keys_use_day_and_hour_buckets() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(daily_stats_key("succeeded", day), "stats:succeeded:2024-01-01");

        let hour = DateTime::parse_from_rfc3339("2024-01-01T07:45:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(hourly_stats_key("failed", hour), "stats:failed:2024-01-01-07");
    }

    #[test]
    fn timestamps_parse_from_rfc3339_or_millis() {
        let expected = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(parse_timestamp(Some("2024-03-01T10:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(Some("1709287200000")), Some(expected));
        assert_eq!(parse_timestamp(Some("yesterday")), None);
        assert_eq!(parse_timestamp(None), None);
    }
}
