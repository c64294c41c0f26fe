//! Shared progress and cancellation handles.
//!
//! Both are passed explicitly into an [`AcquisitionSession`](super::AcquisitionSession).
//! Only the session's polling step writes progress; any number of sinks read it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

/// Completed and expected file counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Files written so far
    pub current: u32,
    /// Files expected; zero means unknown
    pub total: u32,
}

impl Progress {
    /// Completed fraction, or `None` when the total is unknown.
    #[must_use]
    pub fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| f64::from(self.current.min(self.total)) / f64::from(self.total))
    }
}

/// Observable progress of one acquisition.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<Progress>>,
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ProgressHandle {
    /// New handle with no files completed.
    #[must_use]
    pub fn new(total: u32) -> Self {
        let (tx, _) = watch::channel(Progress { current: 0, total });
        Self { tx: Arc::new(tx) }
    }

    /// Latest value.
    #[must_use]
    pub fn get(&self) -> Progress {
        *self.tx.borrow()
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    pub(crate) fn update(&self, current: u32, total: u32) {
        self.tx.send_if_modified(|p| {
            let next = Progress { current, total };
            let changed = *p != next;
            *p = next;
            changed
        });
    }
}

/// Cooperative cancellation signal for the running acquisition.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// New, not-yet-cancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fraction() {
        assert_eq!(Progress { current: 5, total: 10 }.fraction(), Some(0.5));
        assert_eq!(Progress { current: 12, total: 10 }.fraction(), Some(1.0));
        assert_eq!(Progress { current: 3, total: 0 }.fraction(), None);
    }

    #[tokio::test]
    async fn test_progress_updates_are_observed() {
        let handle = ProgressHandle::new(10);
        let mut rx = handle.subscribe();
        handle.update(3, 10);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().current, 3);
        assert_eq!(handle.get(), Progress { current: 3, total: 10 });
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let cancel = CancelHandle::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
        // already cancelled resolves immediately
        cancel.cancelled().await;
    }
}
