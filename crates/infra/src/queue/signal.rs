//! Wake-up signal and cancellation token for blocking dequeues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

/// "New item in queue" signal owned by one queue instance.
///
/// A generation counter makes notifications sticky: a waiter that read
/// generation `n` before querying returns immediately if anything notified
/// in between, so no wake-up is lost.
#[derive(Debug, Default)]
pub struct QueueSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl QueueSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait_timeout(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    signals: Mutex<Vec<Weak<QueueSignal>>>,
}

/// Cooperative cancellation for [`dequeue`](crate::queue::DocumentJobQueue::dequeue).
///
/// Cancelling wakes every queue signal the token has been waiting on, so a
/// blocked worker returns promptly instead of sleeping out its poll interval.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let signals = std::mem::take(
            &mut *self.inner.signals.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for signal in signals.iter().filter_map(Weak::upgrade) {
            signal.notify();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Make `cancel` wake waiters of `signal`.
    pub(crate) fn register(&self, signal: &Arc<QueueSignal>) {
        let mut signals = self.inner.signals.lock().unwrap_or_else(PoisonError::into_inner);
        signals.retain(|s| s.strong_count() > 0);
        if !signals.iter().any(|s| s.as_ptr() == Arc::as_ptr(signal)) {
            signals.push(Arc::downgrade(signal));
        }
        drop(signals);

        if self.is_cancelled() {
            signal.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn notify_before_wait_is_not_lost() {
        let signal = QueueSignal::new();
        let seen = signal.generation();
        signal.notify();

        let started = Instant::now();
        let now = signal.wait_timeout(seen, Duration::from_secs(5));
        assert_eq!(now, seen + 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_without_notification() {
        let signal = QueueSignal::new();
        let seen = signal.generation();
        let now = signal.wait_timeout(seen, Duration::from_millis(20));
        assert_eq!(now, seen);
    }

    #[test]
    fn cancel_wakes_registered_waiter() {
        let signal = Arc::new(QueueSignal::new());
        let token = CancellationToken::new();
        token.register(&signal);
        token.register(&signal);

        let waiter = {
            let signal = signal.clone();
            let seen = signal.generation();
            thread::spawn(move || signal.wait_timeout(seen, Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        token.cancel();
        waiter.join().unwrap();

        assert!(token.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
