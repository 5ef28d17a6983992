//! Background removal of expired documents.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::StorageOptions;
use crate::repository::Repository;
use crate::store::StoreError;

/// Reaper runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaperStats {
    pub passes: u64,
    pub purged: u64,
}

#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    purged: AtomicU64,
}

/// Handle to control a running reaper.
#[derive(Debug)]
pub struct ExpirationReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ExpirationReaperHandle {
    /// Stop the reaper and wait for its thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            passes: self.counters.passes.load(Ordering::Relaxed),
            purged: self.counters.purged.load(Ordering::Relaxed),
        }
    }
}

/// Purges documents whose `expires_at` has passed, in batches.
#[derive(Debug, Clone)]
pub struct ExpirationReaper {
    repository: Repository,
    check_interval: Duration,
    batch_size: usize,
}

impl ExpirationReaper {
    pub fn new(repository: Repository, options: &StorageOptions) -> Self {
        Self {
            repository,
            check_interval: options.expiration_check_interval,
            batch_size: options.expiration_batch_size.max(1),
        }
    }

    /// One pass: purge batches until one comes back short.
    pub fn run_once(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut total = 0;
        loop {
            let purged = self.repository.store().purge_expired(now, self.batch_size)?;
            total += purged;
            if purged < self.batch_size {
                break;
            }
        }
        if total > 0 {
            info!(purged = total, "expired documents removed");
        } else {
            debug!("no expired documents");
        }
        Ok(total)
    }

    /// Run passes on a background thread every check interval.
    pub fn spawn(self) -> io::Result<ExpirationReaperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let counters = Arc::new(Counters::default());
        let thread_counters = counters.clone();

        let join = thread::Builder::new()
            .name("expiration-reaper".to_string())
            .spawn(move || reaper_loop(self, shutdown_rx, thread_counters))?;

        Ok(ExpirationReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            counters,
        })
    }
}

fn reaper_loop(reaper: ExpirationReaper, shutdown_rx: mpsc::Receiver<()>, counters: Arc<Counters>) {
    info!(interval = ?reaper.check_interval, "expiration reaper started");

    loop {
        match reaper.run_once() {
            Ok(purged) => {
                counters.purged.fetch_add(purged as u64, Ordering::Relaxed);
            }
            Err(e) => error!(error = %e, "expiration pass failed"),
        }
        counters.passes.fetch_add(1, Ordering::Relaxed);

        match shutdown_rx.recv_timeout(reaper.check_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("expiration reaper stopped");
}
