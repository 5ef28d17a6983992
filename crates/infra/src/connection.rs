//! Storage connection: the read side and server lifecycle used by the host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use jobdoc_core::{
    Document, DocumentId, HashDocument, Invocation, InvocationData, JobDocument, JobId,
    ListDocument, ServerData, ServerDocument, SetDocument, StateData,
};

use crate::queue::{
    CancellationToken, FetchedJob, JobQueueProvider, PersistentJobQueue, QueueError, QueueProviders,
};
use crate::repository::Repository;
use crate::session::DocumentSession;
use crate::store::{DocumentQuery, StoreError};
use crate::transaction::{WriteOnlyTransaction, expires_in};

/// Job as seen by a worker about to perform it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobData {
    /// `None` when the stored invocation cannot be deserialized.
    pub job: Option<Invocation>,
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Why `job` is missing.
    pub load_error: Option<String>,
}

#[derive(Clone)]
pub struct StorageConnection {
    repository: Repository,
    queue_providers: Arc<QueueProviders>,
}

impl std::fmt::Debug for StorageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConnection")
            .field("queue_providers", &self.queue_providers)
            .finish_non_exhaustive()
    }
}

impl StorageConnection {
    pub fn new(repository: Repository, queue_providers: Arc<QueueProviders>) -> Self {
        Self {
            repository,
            queue_providers,
        }
    }

    fn session(&self) -> DocumentSession {
        self.repository.open_session()
    }

    fn id<T: Document>(&self, key: &str) -> DocumentId {
        self.repository.id_for::<T>(&[key])
    }

    fn load<T: Document>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.session().load(&self.id::<T>(key))
    }

    fn ttl<T: Document>(&self, key: &str) -> Result<Option<chrono::Duration>, StoreError> {
        let expiry = self.session().get_expiry(&self.id::<T>(key))?;
        Ok(expiry.map(|at| at - Utc::now()))
    }

    pub fn create_write_transaction(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(self.repository.clone(), self.queue_providers.clone())
    }

    // Jobs

    /// Persist a new job that expires unless a later state change persists
    /// it. Returns the generated id.
    pub fn create_expired_job(
        &self,
        invocation_data: InvocationData,
        parameters: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<JobId, StoreError> {
        let job_id = JobId::generate();
        let id = self.id::<JobDocument>(job_id.as_str());
        let job = JobDocument {
            invocation_data,
            parameters,
            created_at,
            state: None,
            history: Vec::new(),
        };

        let mut session = self.session();
        session.store(&id, &job)?;
        session.set_expiry(&id, expires_in(created_at, expire_in))?;
        session.save_changes()?;

        debug!(job_id = %job_id, "job created");
        Ok(job_id)
    }

    pub fn set_job_parameter(&self, job_id: &JobId, name: &str, value: &str) -> Result<(), StoreError> {
        let id = self.id::<JobDocument>(job_id.as_str());
        let mut session = self.session();
        let mut job: JobDocument = session
            .load(&id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        job.parameters.insert(name.to_string(), value.to_string());
        session.store(&id, &job)?;
        session.save_changes()
    }

    pub fn get_job_parameter(&self, job_id: &JobId, name: &str) -> Result<Option<String>, StoreError> {
        let job: Option<JobDocument> = self.load(job_id.as_str())?;
        Ok(job.and_then(|mut j| j.parameters.remove(name)))
    }

    pub fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>, StoreError> {
        let Some(job) = self.load::<JobDocument>(job_id.as_str())? else {
            return Ok(None);
        };

        let (invocation, load_error) = match job.invocation_data.deserialize() {
            Ok(invocation) => (Some(invocation), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok(Some(JobData {
            job: invocation,
            state: job.state.map(|s| s.name),
            created_at: job.created_at,
            load_error,
        }))
    }

    pub fn get_state_data(&self, job_id: &JobId) -> Result<Option<StateData>, StoreError> {
        let job: Option<JobDocument> = self.load(job_id.as_str())?;
        Ok(job.and_then(|j| j.state))
    }

    // Servers

    pub fn announce_server(&self, server_id: &str, data: ServerData) -> Result<(), StoreError> {
        let id = self.id::<ServerDocument>(server_id);
        let mut session = self.session();
        let mut server: ServerDocument = session.load_or_default(&id)?;
        server.data = data;
        server.last_heartbeat = Utc::now();
        session.store(&id, &server)?;
        session.save_changes()?;

        info!(server_id, workers = server.data.worker_count, "server announced");
        Ok(())
    }

    /// Refresh the heartbeat. Returns `false` when the server is unknown
    /// (e.g. it was removed as timed out).
    pub fn heartbeat(&self, server_id: &str) -> Result<bool, StoreError> {
        let id = self.id::<ServerDocument>(server_id);
        let mut session = self.session();
        let Some(mut server) = session.load::<ServerDocument>(&id)? else {
            return Ok(false);
        };
        server.last_heartbeat = Utc::now();
        session.store(&id, &server)?;
        session.save_changes()?;
        Ok(true)
    }

    pub fn remove_server(&self, server_id: &str) -> Result<(), StoreError> {
        let mut session = self.session();
        session.delete(&self.id::<ServerDocument>(server_id));
        session.save_changes()?;
        info!(server_id, "server removed");
        Ok(())
    }

    /// Delete servers whose last heartbeat is older than `timeout`.
    pub fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut session = self.session();
        let servers = session.query::<ServerDocument>(&DocumentQuery::of::<ServerDocument>())?;
        let mut removed = 0;
        for (id, server) in servers {
            if server.last_heartbeat < cutoff {
                session.delete(&id);
                removed += 1;
            }
        }
        session.save_changes()?;

        if removed > 0 {
            info!(removed, "timed out servers removed");
        }
        Ok(removed)
    }

    // Sets

    pub fn get_all_items_from_set(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let set: Option<SetDocument> = self.load(key)?;
        Ok(set.map(|s| s.scores.into_keys().collect()).unwrap_or_default())
    }

    /// Lowest-scored member with a score in `[from_score, to_score]`.
    pub fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> Result<Option<String>, StoreError> {
        if to_score < from_score {
            return Err(StoreError::InvalidQuery(
                "to_score must not be lower than from_score".to_string(),
            ));
        }
        let Some(set) = self.load::<SetDocument>(key)? else {
            return Ok(None);
        };
        Ok(set
            .ranked()
            .into_iter()
            .find(|(_, score)| *score >= from_score && *score <= to_score)
            .map(|(member, _)| member.to_string()))
    }

    pub fn get_set_count(&self, key: &str) -> Result<usize, StoreError> {
        let set: Option<SetDocument> = self.load(key)?;
        Ok(set.map(|s| s.scores.len()).unwrap_or(0))
    }

    /// Members ranked by score, inclusive index range.
    pub fn get_range_from_set(&self, key: &str, starting_from: usize, ending_at: usize) -> Result<Vec<String>, StoreError> {
        let Some(set) = self.load::<SetDocument>(key)? else {
            return Ok(Vec::new());
        };
        Ok(slice(set.ranked().into_iter().map(|(m, _)| m.to_string()), starting_from, ending_at))
    }

    pub fn get_set_ttl(&self, key: &str) -> Result<Option<chrono::Duration>, StoreError> {
        self.ttl::<SetDocument>(key)
    }

    // Counters

    pub fn get_counter(&self, key: &str) -> Result<i64, StoreError> {
        let counter: Option<jobdoc_core::CounterDocument> = self.load(key)?;
        Ok(counter.map(|c| c.value).unwrap_or(0))
    }

    // Hashes

    /// Write hash fields in a transaction of their own.
    pub fn set_range_in_hash<I, K, V>(&self, key: &str, pairs: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut tx = self.create_write_transaction();
        tx.set_range_in_hash(key, pairs)?;
        tx.commit()
    }

    pub fn get_all_entries_from_hash(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let hash: Option<HashDocument> = self.load(key)?;
        Ok(hash.map(|h| h.fields))
    }

    pub fn get_value_from_hash(&self, key: &str, name: &str) -> Result<Option<String>, StoreError> {
        let hash: Option<HashDocument> = self.load(key)?;
        Ok(hash.and_then(|mut h| h.fields.remove(name)))
    }

    pub fn get_hash_count(&self, key: &str) -> Result<usize, StoreError> {
        let hash: Option<HashDocument> = self.load(key)?;
        Ok(hash.map(|h| h.fields.len()).unwrap_or(0))
    }

    pub fn get_hash_ttl(&self, key: &str) -> Result<Option<chrono::Duration>, StoreError> {
        self.ttl::<HashDocument>(key)
    }

    // Lists

    pub fn get_list_count(&self, key: &str) -> Result<usize, StoreError> {
        let list: Option<ListDocument> = self.load(key)?;
        Ok(list.map(|l| l.values.len()).unwrap_or(0))
    }

    pub fn get_list_ttl(&self, key: &str) -> Result<Option<chrono::Duration>, StoreError> {
        self.ttl::<ListDocument>(key)
    }

    pub fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let list: Option<ListDocument> = self.load(key)?;
        Ok(list.map(|l| l.values).unwrap_or_default())
    }

    /// Inclusive index range in insertion order.
    pub fn get_range_from_list(&self, key: &str, starting_from: usize, ending_at: usize) -> Result<Vec<String>, StoreError> {
        let list: Option<ListDocument> = self.load(key)?;
        Ok(slice(list.map(|l| l.values).unwrap_or_default(), starting_from, ending_at))
    }

    // Queue

    /// Lease the next job of `queues`, blocking until one is available or
    /// `token` is cancelled. All queues must be served by the same provider.
    pub fn fetch_next_job(
        &self,
        queues: &[&str],
        token: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>, QueueError> {
        let Some(first) = queues.first() else {
            return Err(QueueError::InvalidArgument(
                "at least one queue must be given".to_string(),
            ));
        };

        let provider: &Arc<dyn JobQueueProvider> = self.queue_providers.get_provider(first);
        if queues
            .iter()
            .any(|q| !Arc::ptr_eq(self.queue_providers.get_provider(q), provider))
        {
            return Err(QueueError::InvalidArgument(format!(
                "queues {queues:?} are served by more than one provider"
            )));
        }

        provider.job_queue().dequeue(queues, token)
    }
}

fn slice<I>(items: I, starting_from: usize, ending_at: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    if ending_at < starting_from {
        return Vec::new();
    }
    items
        .into_iter()
        .skip(starting_from)
        .take((ending_at - starting_from).saturating_add(1))
        .collect()
}
