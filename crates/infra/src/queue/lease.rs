use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use jobdoc_core::{Document, DocumentId, JobId, QueueEntry};

use crate::repository::Repository;
use crate::store::{ExpectedEtag, StoreError, StoredDocument, WriteBatch, WriteOp};

use super::provider::FetchedJob;

/// Lease on a queue entry claimed by [`DocumentJobQueue`](super::DocumentJobQueue).
///
/// The lease owns the entry only while the entry still carries the
/// `fetched_at` stamp written by its claim. Once the invisibility timeout
/// hands the entry to another consumer, resolving this lease is a no-op.
///
/// Dropping the lease without resolving it puts the entry back on the queue.
#[derive(Debug)]
pub struct DocumentFetchedJob {
    repository: Repository,
    entry_id: DocumentId,
    job_id: JobId,
    queue: String,
    claimed_at: Option<DateTime<Utc>>,
    resolved: bool,
}

impl DocumentFetchedJob {
    pub(crate) fn new(repository: Repository, entry_id: DocumentId, entry: QueueEntry) -> Self {
        Self {
            repository,
            entry_id,
            job_id: entry.job_id,
            queue: entry.queue,
            claimed_at: entry.fetched_at,
            resolved: false,
        }
    }

    pub fn entry_id(&self) -> &DocumentId {
        &self.entry_id
    }

    /// `fetched_at` stamp this lease was claimed with.
    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    /// The stored entry, if it still exists and is still stamped by this lease.
    fn owned_entry(&self) -> Result<Option<(StoredDocument, QueueEntry)>, StoreError> {
        let loaded = self.repository.store().load(std::slice::from_ref(&self.entry_id))?;
        let Some(stored) = loaded.into_iter().next().flatten() else {
            return Ok(None);
        };
        let entry: QueueEntry = stored.decode()?;
        if entry.fetched_at != self.claimed_at {
            debug!(
                entry = %self.entry_id,
                job_id = %self.job_id,
                "queue entry was re-leased by another consumer"
            );
            return Ok(None);
        }
        Ok(Some((stored, entry)))
    }

    /// Apply one etag-guarded write. Losing the race means another consumer
    /// re-leased the entry in between, which leaves nothing for us to do.
    fn commit_owned(&self, op: WriteOp) -> Result<bool, StoreError> {
        let mut batch = WriteBatch::new();
        batch.push(op);
        match self.repository.store().commit(batch) {
            Ok(()) => Ok(true),
            Err(StoreError::Concurrency(reason)) => {
                debug!(entry = %self.entry_id, %reason, "lease lost before it was resolved");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn requeue(&self) -> Result<bool, StoreError> {
        let Some((stored, mut entry)) = self.owned_entry()? else {
            return Ok(false);
        };
        entry.fetched_at = None;
        self.commit_owned(WriteOp::Put {
            id: self.entry_id.clone(),
            body: entry.to_json()?,
            expires_at: stored.expires_at,
            expected: ExpectedEtag::Exact(stored.etag),
        })
    }
}

impl FetchedJob for DocumentFetchedJob {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn acknowledge(&mut self) -> Result<(), StoreError> {
        let removed = match self.owned_entry()? {
            Some((stored, _)) => self.commit_owned(WriteOp::Delete {
                id: self.entry_id.clone(),
                expected: ExpectedEtag::Exact(stored.etag),
            })?,
            None => false,
        };
        self.resolved = true;
        debug!(job_id = %self.job_id, queue = %self.queue, removed, "queue entry acknowledged");
        Ok(())
    }

    fn abandon(&mut self) -> Result<(), StoreError> {
        let requeued = self.requeue()?;
        self.resolved = true;
        debug!(job_id = %self.job_id, queue = %self.queue, requeued, "queue entry abandoned");
        Ok(())
    }
}

impl Drop for DocumentFetchedJob {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Err(e) = self.requeue() {
            warn!(
                job_id = %self.job_id,
                queue = %self.queue,
                error = %e,
                "failed to requeue unresolved lease; it becomes visible after the invisibility timeout"
            );
        }
    }
}
