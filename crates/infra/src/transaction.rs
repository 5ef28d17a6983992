//! Write-only transaction.
//!
//! Buffers every mutation of one logical unit of work in a
//! [`DocumentSession`] and commits it as a single batch. Counter updates on
//! existing counters are deferred as server-side increments so concurrent
//! transactions never overwrite each other's deltas.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use jobdoc_core::{
    CounterDocument, Document, DocumentId, HashDocument, JobDocument, JobId, JobState,
    ListDocument, SetDocument, StateData, StateHistoryEntry,
};

use crate::queue::QueueProviders;
use crate::repository::Repository;
use crate::session::DocumentSession;
use crate::store::{StoreError, WriteOp};

type AfterCommit = Box<dyn FnOnce() + Send>;

/// Absolute timestamp `expire_in` after `now`, saturating far in the future.
pub(crate) fn expires_in(now: DateTime<Utc>, expire_in: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expire_in)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Buffered mutation set committed all-or-nothing.
pub struct WriteOnlyTransaction {
    repository: Repository,
    session: DocumentSession,
    queue_providers: Arc<QueueProviders>,
    after_commit: Vec<AfterCommit>,
}

impl std::fmt::Debug for WriteOnlyTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOnlyTransaction")
            .field("session", &self.session)
            .field("after_commit", &self.after_commit.len())
            .finish_non_exhaustive()
    }
}

impl WriteOnlyTransaction {
    pub fn new(repository: Repository, queue_providers: Arc<QueueProviders>) -> Self {
        let session = repository.open_session().with_optimistic_concurrency(true);
        Self {
            repository,
            session,
            queue_providers,
            after_commit: Vec::new(),
        }
    }

    fn id<T: Document>(&self, key: &str) -> DocumentId {
        self.repository.id_for::<T>(&[key])
    }

    /// Run `action` after a successful commit, in registration order.
    pub fn after_commit<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.after_commit.push(Box::new(action));
    }

    /// Save everything buffered so far.
    ///
    /// A conflict with another unit of work rejects the whole transaction
    /// ([`StoreError::is_retryable`]); nothing is partially applied and the
    /// post-commit actions are dropped without running.
    pub fn commit(mut self) -> Result<(), StoreError> {
        if let Err(e) = self.session.save_changes() {
            error!(error = %e, retryable = e.is_retryable(), "transaction commit failed");
            return Err(e);
        }
        for action in self.after_commit.drain(..) {
            action();
        }
        Ok(())
    }

    // Jobs

    pub fn expire_job(&mut self, job_id: &JobId, expire_in: Duration) -> Result<(), StoreError> {
        let id = self.id::<JobDocument>(job_id.as_str());
        if !self.session.set_expiry(&id, expires_in(Utc::now(), expire_in))? {
            debug!(job_id = %job_id, "expire_job on missing job ignored");
        }
        Ok(())
    }

    pub fn persist_job(&mut self, job_id: &JobId) -> Result<(), StoreError> {
        let id = self.id::<JobDocument>(job_id.as_str());
        if !self.session.remove_expiry(&id)? {
            debug!(job_id = %job_id, "persist_job on missing job ignored");
        }
        Ok(())
    }

    /// Replace the current state and prepend it to the history.
    pub fn set_job_state(&mut self, job_id: &JobId, state: &dyn JobState) -> Result<(), StoreError> {
        let id = self.id::<JobDocument>(job_id.as_str());
        let mut job: JobDocument = self
            .session
            .load(&id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        job.history.insert(0, StateHistoryEntry::from_state(state, Utc::now()));
        job.state = Some(StateData::from_state(state));
        self.session.store(&id, &job)
    }

    pub fn add_job_state(&mut self, job_id: &JobId, state: &dyn JobState) -> Result<(), StoreError> {
        self.set_job_state(job_id, state)
    }

    /// Enqueue through the provider owning `queue`; its consumers are
    /// notified once the commit succeeds.
    pub fn add_to_queue(&mut self, queue: &str, job_id: &JobId) -> Result<(), StoreError> {
        let job_queue = self.queue_providers.get_provider(queue).job_queue();
        job_queue.enqueue_in(&mut self.session, queue, job_id)?;
        self.after_commit(move || job_queue.notify_enqueued());
        Ok(())
    }

    // Counters

    pub fn increment_counter(&mut self, key: &str) -> Result<(), StoreError> {
        self.update_counter(key, 1, None)
    }

    pub fn increment_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        self.update_counter(key, 1, Some(expire_in))
    }

    pub fn decrement_counter(&mut self, key: &str) -> Result<(), StoreError> {
        self.update_counter(key, -1, None)
    }

    pub fn decrement_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        self.update_counter(key, -1, Some(expire_in))
    }

    fn update_counter(&mut self, key: &str, delta: i64, expire_in: Option<Duration>) -> Result<(), StoreError> {
        let id = self.id::<CounterDocument>(key);
        let expires_at = expire_in.map(|e| expires_in(Utc::now(), e));

        match self.session.load::<CounterDocument>(&id)? {
            // Created in this unit of work: still a plain in-memory document.
            Some(mut counter) if self.session.is_new(&id) => {
                counter.value += delta;
                self.session.store(&id, &counter)?;
                if let Some(at) = expires_at {
                    self.session.set_expiry(&id, at)?;
                }
            }
            Some(_) => self.session.defer(WriteOp::Increment {
                id,
                field: CounterDocument::VALUE_FIELD.to_string(),
                delta,
                expires_at,
            }),
            None => {
                self.session.store(&id, &CounterDocument { value: delta })?;
                if let Some(at) = expires_at {
                    self.session.set_expiry(&id, at)?;
                }
            }
        }
        Ok(())
    }

    // Sets

    pub fn add_to_set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.add_to_set_with_score(key, value, 0.0)
    }

    pub fn add_to_set_with_score(&mut self, key: &str, value: &str, score: f64) -> Result<(), StoreError> {
        let id = self.id::<SetDocument>(key);
        let mut set: SetDocument = self.session.load_or_default(&id)?;
        set.scores.insert(value.to_string(), score);
        self.session.store(&id, &set)
    }

    pub fn add_range_to_set(&mut self, key: &str, items: &[String]) -> Result<(), StoreError> {
        let id = self.id::<SetDocument>(key);
        let mut set: SetDocument = self.session.load_or_default(&id)?;
        for item in items {
            set.scores.insert(item.clone(), 0.0);
        }
        self.session.store(&id, &set)
    }

    /// Remove a member; the set document goes away with its last member.
    pub fn remove_from_set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let id = self.id::<SetDocument>(key);
        let mut set: SetDocument = self.session.load_or_default(&id)?;
        set.scores.remove(value);
        if set.scores.is_empty() {
            self.session.delete(&id);
            Ok(())
        } else {
            self.session.store(&id, &set)
        }
    }

    pub fn remove_set(&mut self, key: &str) -> Result<(), StoreError> {
        let id = self.id::<SetDocument>(key);
        self.session.delete(&id);
        Ok(())
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        self.expire::<SetDocument>(key, expire_in)
    }

    pub fn persist_set(&mut self, key: &str) -> Result<(), StoreError> {
        self.persist::<SetDocument>(key)
    }

    // Lists

    pub fn insert_to_list(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let id = self.id::<ListDocument>(key);
        let mut list: ListDocument = self.session.load_or_default(&id)?;
        list.values.push(value.to_string());
        self.session.store(&id, &list)
    }

    /// Remove every occurrence of `value`; an emptied list is deleted.
    pub fn remove_from_list(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let id = self.id::<ListDocument>(key);
        let mut list: ListDocument = self.session.load_or_default(&id)?;
        list.values.retain(|v| v != value);
        self.store_or_delete_list(&id, &list)
    }

    /// Keep only the inclusive range `[keep_from, keep_to]`.
    pub fn trim_list(&mut self, key: &str, keep_from: usize, keep_to: usize) -> Result<(), StoreError> {
        let id = self.id::<ListDocument>(key);
        let mut list: ListDocument = self.session.load_or_default(&id)?;
        list.trim(keep_from, keep_to);
        self.store_or_delete_list(&id, &list)
    }

    fn store_or_delete_list(&mut self, id: &DocumentId, list: &ListDocument) -> Result<(), StoreError> {
        if list.values.is_empty() {
            self.session.delete(id);
            Ok(())
        } else {
            self.session.store(id, list)
        }
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        self.expire::<ListDocument>(key, expire_in)
    }

    pub fn persist_list(&mut self, key: &str) -> Result<(), StoreError> {
        self.persist::<ListDocument>(key)
    }

    // Hashes

    pub fn set_range_in_hash<I, K, V>(&mut self, key: &str, pairs: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let id = self.id::<HashDocument>(key);
        let mut hash: HashDocument = self.session.load_or_default(&id)?;
        for (field, value) in pairs {
            hash.fields.insert(field.into(), value.into());
        }
        self.session.store(&id, &hash)
    }

    pub fn remove_hash(&mut self, key: &str) -> Result<(), StoreError> {
        let id = self.id::<HashDocument>(key);
        self.session.delete(&id);
        Ok(())
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        self.expire::<HashDocument>(key, expire_in)
    }

    pub fn persist_hash(&mut self, key: &str) -> Result<(), StoreError> {
        self.persist::<HashDocument>(key)
    }

    // Expiry of find-or-create collections: touching a missing key creates
    // the empty document so the expiry has something to attach to.

    fn expire<T: Document + Default>(&mut self, key: &str, expire_in: Duration) -> Result<(), StoreError> {
        let id = self.id::<T>(key);
        let _: T = self.session.load_or_default(&id)?;
        self.session.set_expiry(&id, expires_in(Utc::now(), expire_in))?;
        Ok(())
    }

    fn persist<T: Document + Default>(&mut self, key: &str) -> Result<(), StoreError> {
        let id = self.id::<T>(key);
        let _: T = self.session.load_or_default(&id)?;
        self.session.remove_expiry(&id)?;
        Ok(())
    }
}
