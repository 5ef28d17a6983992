//! Document-backed job queue.
//!
//! Each pending delivery is one [`QueueEntry`] document. A consumer leases an
//! entry by stamping `fetched_at` under an etag check, so two workers racing
//! for the same entry cannot both win: the loser sees a concurrency error and
//! moves on to the next candidate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use jobdoc_core::{Document, DocumentId, JobId, QueueEntry};

use crate::config::StorageOptions;
use crate::repository::Repository;
use crate::session::DocumentSession;
use crate::store::{DocumentQuery, StoreError};

use super::lease::DocumentFetchedJob;
use super::provider::{FetchedJob, PersistentJobQueue, QueueError};
use super::signal::{CancellationToken, QueueSignal};

pub struct DocumentJobQueue {
    repository: Repository,
    signal: Arc<QueueSignal>,
    poll_interval: Duration,
    invisibility_timeout: chrono::Duration,
}

impl std::fmt::Debug for DocumentJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentJobQueue")
            .field("poll_interval", &self.poll_interval)
            .field("invisibility_timeout", &self.invisibility_timeout)
            .finish_non_exhaustive()
    }
}

impl DocumentJobQueue {
    pub fn new(repository: Repository, options: &StorageOptions) -> Self {
        Self {
            repository,
            signal: Arc::new(QueueSignal::new()),
            poll_interval: options.queue_poll_interval,
            invisibility_timeout: options.invisibility_timeout_chrono(),
        }
    }

    pub fn signal(&self) -> &Arc<QueueSignal> {
        &self.signal
    }

    /// Enqueue in a unit of work of its own and wake waiting consumers.
    pub fn enqueue(&self, queue: &str, job_id: &JobId) -> Result<(), StoreError> {
        let mut session = self.repository.open_session();
        self.enqueue_in(&mut session, queue, job_id)?;
        session.save_changes()?;
        self.signal.notify();
        Ok(())
    }

    /// Lease the oldest claimable entry of `queues`, blocking until one is
    /// available or `token` is cancelled.
    #[instrument(skip(self, token), level = "debug")]
    pub fn dequeue_lease(
        &self,
        queues: &[&str],
        token: &CancellationToken,
    ) -> Result<DocumentFetchedJob, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::InvalidArgument(
                "at least one queue must be given".to_string(),
            ));
        }
        token.register(&self.signal);

        loop {
            if token.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            let seen = self.signal.generation();

            if let Some(lease) = self.try_claim(queues)? {
                return Ok(lease);
            }

            if token.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            self.signal.wait_timeout(seen, self.poll_interval);
        }
    }

    fn try_claim(&self, queues: &[&str]) -> Result<Option<DocumentFetchedJob>, StoreError> {
        let pending = DocumentQuery::of::<QueueEntry>()
            .where_in("queue", queues.iter().copied())
            .where_null("fetched_at");
        if let Some(lease) = self.claim_first(&pending)? {
            return Ok(Some(lease));
        }

        // Leases older than the invisibility timeout were abandoned by a
        // dead worker. No cutoff means leases never expire.
        let Some(cutoff) = Utc::now().checked_sub_signed(self.invisibility_timeout) else {
            return Ok(None);
        };
        let stale = DocumentQuery::of::<QueueEntry>()
            .where_in("queue", queues.iter().copied())
            .where_before("fetched_at", cutoff);
        self.claim_first(&stale)
    }

    fn claim_first(&self, query: &DocumentQuery) -> Result<Option<DocumentFetchedJob>, StoreError> {
        let candidates = self.repository.open_session().query::<QueueEntry>(query)?;
        for (id, _) in candidates {
            if let Some(lease) = self.claim(&id)? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Stamp one entry as fetched. `None` when another consumer got there
    /// first or the entry vanished.
    fn claim(&self, id: &DocumentId) -> Result<Option<DocumentFetchedJob>, StoreError> {
        let mut session = self.repository.open_session();
        let Some(mut entry) = session.load::<QueueEntry>(id)? else {
            return Ok(None);
        };
        let now = Utc::now();
        if !entry.is_claimable(now, self.invisibility_timeout) {
            return Ok(None);
        }

        entry.fetched_at = Some(now);
        session.store(id, &entry)?;
        match session.save_changes() {
            Ok(()) => {
                debug!(entry = %id, job_id = %entry.job_id, queue = %entry.queue, "queue entry leased");
                Ok(Some(DocumentFetchedJob::new(self.repository.clone(), id.clone(), entry)))
            }
            Err(StoreError::Concurrency(reason)) => {
                debug!(entry = %id, %reason, "lost lease race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl PersistentJobQueue for DocumentJobQueue {
    fn enqueue_in(
        &self,
        session: &mut DocumentSession,
        queue: &str,
        job_id: &JobId,
    ) -> Result<(), StoreError> {
        let id = DocumentId::generated(QueueEntry::COLLECTION);
        session.store(&id, &QueueEntry::new(queue, job_id.clone()))
    }

    fn dequeue(
        &self,
        queues: &[&str],
        token: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>, QueueError> {
        let lease = self.dequeue_lease(queues, token)?;
        Ok(Box::new(lease))
    }

    fn notify_enqueued(&self) {
        self.signal.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use std::thread;
    use std::time::Instant;

    fn queue_with(options: StorageOptions) -> (Repository, DocumentJobQueue) {
        let repo = Repository::new(InMemoryDocumentStore::new());
        let queue = DocumentJobQueue::new(repo.clone(), &options);
        (repo, queue)
    }

    fn fast() -> StorageOptions {
        StorageOptions::default().with_queue_poll_interval(Duration::from_millis(20))
    }

    fn entries(repo: &Repository) -> Vec<QueueEntry> {
        repo.open_session()
            .query::<QueueEntry>(&DocumentQuery::of::<QueueEntry>())
            .unwrap()
            .into_iter()
            .map(|(_, e)| e)
            .collect()
    }

    #[test]
    fn dequeue_returns_oldest_entry_of_requested_queues() {
        let (_, queue) = queue_with(fast());
        queue.enqueue("low", &JobId::from("0")).unwrap();
        queue.enqueue("default", &JobId::from("1")).unwrap();
        queue.enqueue("default", &JobId::from("2")).unwrap();

        let token = CancellationToken::new();
        let mut lease = queue.dequeue_lease(&["default", "critical"], &token).unwrap();
        assert_eq!(lease.job_id().as_str(), "1");
        assert_eq!(lease.queue(), "default");
        lease.acknowledge().unwrap();
    }

    #[test]
    fn leased_entry_is_invisible_until_abandoned() {
        let (repo, queue) = queue_with(fast());
        queue.enqueue("default", &JobId::from("1")).unwrap();
        let token = CancellationToken::new();

        let mut first = queue.dequeue_lease(&["default"], &token).unwrap();
        assert!(queue.try_claim(&["default"]).unwrap().is_none());

        first.abandon().unwrap();
        assert!(entries(&repo)[0].fetched_at.is_none());

        let mut second = queue.dequeue_lease(&["default"], &token).unwrap();
        assert_eq!(second.job_id().as_str(), "1");
        second.acknowledge().unwrap();
        assert!(entries(&repo).is_empty());
    }

    #[test]
    fn dropped_lease_is_requeued() {
        let (repo, queue) = queue_with(fast());
        queue.enqueue("default", &JobId::from("1")).unwrap();

        let lease = queue.dequeue_lease(&["default"], &CancellationToken::new()).unwrap();
        assert!(entries(&repo)[0].fetched_at.is_some());
        drop(lease);

        assert!(entries(&repo)[0].fetched_at.is_none());
    }

    #[test]
    fn stale_lease_is_reclaimable_after_invisibility_timeout() {
        let options = fast().with_invisibility_timeout(Duration::from_millis(10));
        let (_, queue) = queue_with(options);
        queue.enqueue("default", &JobId::from("1")).unwrap();
        let token = CancellationToken::new();

        let mut stale = queue.dequeue_lease(&["default"], &token).unwrap();
        thread::sleep(Duration::from_millis(30));

        let mut again = queue.dequeue_lease(&["default"], &token).unwrap();
        assert_eq!(again.job_id().as_str(), "1");
        again.acknowledge().unwrap();
        stale.acknowledge().unwrap();
    }

    #[test]
    fn superseded_lease_leaves_the_reclaimed_entry_alone() {
        let options = fast().with_invisibility_timeout(Duration::from_millis(200));
        let (repo, queue) = queue_with(options);
        queue.enqueue("default", &JobId::from("1")).unwrap();
        let token = CancellationToken::new();

        let stale = queue.dequeue_lease(&["default"], &token).unwrap();
        thread::sleep(Duration::from_millis(250));
        let mut current = queue.dequeue_lease(&["default"], &token).unwrap();
        assert_ne!(stale.claimed_at(), current.claimed_at());

        // The superseded lease must not hand the entry to a third consumer.
        drop(stale);
        assert_eq!(entries(&repo)[0].fetched_at, current.claimed_at());
        assert!(queue.try_claim(&["default"]).unwrap().is_none());

        current.acknowledge().unwrap();
        assert!(entries(&repo).is_empty());
    }

    #[test]
    fn superseded_lease_cannot_acknowledge_or_abandon() {
        let options = fast().with_invisibility_timeout(Duration::from_millis(200));
        let (repo, queue) = queue_with(options);
        queue.enqueue("default", &JobId::from("1")).unwrap();
        let token = CancellationToken::new();

        let mut stale = queue.dequeue_lease(&["default"], &token).unwrap();
        thread::sleep(Duration::from_millis(250));
        let mut current = queue.dequeue_lease(&["default"], &token).unwrap();

        stale.acknowledge().unwrap();
        assert_eq!(entries(&repo).len(), 1);
        stale.abandon().unwrap();
        assert_eq!(entries(&repo)[0].fetched_at, current.claimed_at());

        current.abandon().unwrap();
        assert!(entries(&repo)[0].fetched_at.is_none());
    }

    #[test]
    fn unbounded_invisibility_timeout_keeps_leases_forever() {
        let (_, queue) = queue_with(fast().with_invisibility_timeout(Duration::MAX));
        queue.enqueue("default", &JobId::from("1")).unwrap();

        let mut lease = queue.dequeue_lease(&["default"], &CancellationToken::new()).unwrap();
        assert!(queue.try_claim(&["default"]).unwrap().is_none());
        lease.acknowledge().unwrap();
    }

    #[test]
    fn pending_entries_are_claimed_before_stale_leases() {
        let options = fast().with_invisibility_timeout(Duration::from_millis(10));
        let (_, queue) = queue_with(options);
        queue.enqueue("default", &JobId::from("old")).unwrap();
        let token = CancellationToken::new();

        let stale = queue.dequeue_lease(&["default"], &token).unwrap();
        std::mem::forget(stale);
        thread::sleep(Duration::from_millis(30));
        queue.enqueue("default", &JobId::from("new")).unwrap();

        let mut first = queue.try_claim(&["default"]).unwrap().unwrap();
        assert_eq!(first.job_id().as_str(), "new");
        let mut second = queue.try_claim(&["default"]).unwrap().unwrap();
        assert_eq!(second.job_id().as_str(), "old");

        first.acknowledge().unwrap();
        second.acknowledge().unwrap();
    }

    #[test]
    fn enqueue_wakes_blocked_consumer() {
        let options = StorageOptions::default().with_queue_poll_interval(Duration::from_secs(30));
        let (_, queue) = queue_with(options);
        let queue = Arc::new(queue);
        let token = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let token = token.clone();
            thread::spawn(move || {
                let mut lease = queue.dequeue_lease(&["default"], &token).unwrap();
                lease.acknowledge().unwrap();
                lease.job_id().clone()
            })
        };

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        queue.enqueue("default", &JobId::from("wake")).unwrap();

        assert_eq!(consumer.join().unwrap().as_str(), "wake");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let options = StorageOptions::default().with_queue_poll_interval(Duration::from_secs(30));
        let (_, queue) = queue_with(options);
        let queue = Arc::new(queue);
        let token = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let token = token.clone();
            thread::spawn(move || queue.dequeue_lease(&["default"], &token).map(|_| ()))
        };

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let err = consumer.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn empty_queue_list_is_rejected() {
        let (_, queue) = queue_with(fast());
        let err = queue.dequeue_lease(&[], &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[test]
    fn competing_consumers_never_share_an_entry() {
        let (_, queue) = queue_with(fast());
        let queue = Arc::new(queue);
        for i in 0..20 {
            queue.enqueue("default", &JobId::from(i.to_string())).unwrap();
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(mut lease) = queue.try_claim(&["default"]).unwrap() {
                        lease.acknowledge().unwrap();
                        seen.push(lease.job_id().as_str().to_string());
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<String> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len());
        assert_eq!(all.len(), 20);
    }
}
