//! Per-process lifecycle with a lame-duck drain.
//!
//! Servers hold a [`Lifecycle`] and wrap each unit of in-flight work in a
//! [`WorkGuard`]. A shutdown request flips the process into lame-duck mode:
//! new work is refused, pending work is given up to the lame-duck period to
//! drain, then shutdown callbacks run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

struct LifecycleInner {
    lame_duck_period: Duration,
    shutting_down: watch::Sender<bool>,
    pending: AtomicUsize,
    drained: Notify,
    shutdown_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// Explicit process lifecycle object, threaded into every server instead of
/// process-global state.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

/// Tracks one unit of in-flight work. Dropping the guard marks the work
/// finished.
pub struct WorkGuard {
    inner: Arc<LifecycleInner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Lifecycle {
    pub fn new(lame_duck_period: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Lifecycle {
            inner: Arc::new(LifecycleInner {
                lame_duck_period,
                shutting_down: tx,
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
                shutdown_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A receiver that flips to `true` when shutdown begins. Listeners use
    /// this to stop accepting new subscribers.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutting_down.subscribe()
    }

    /// True once shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutting_down.borrow()
    }

    /// Start a unit of work, or `None` when the process is lame-ducking.
    pub fn start_work(&self) -> Option<WorkGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Some(WorkGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Register a callback to run after the drain completes.
    pub fn on_shutdown<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.shutdown_callbacks.lock().push(Box::new(f));
    }

    /// Enter lame-duck mode, wait for pending work up to the lame-duck
    /// period, then run shutdown callbacks.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutting_down.send(true);
        let pending = self.inner.pending.load(Ordering::Acquire);
        if pending > 0 {
            info!(pending, "lame duck: draining pending work");
            let drain = async {
                loop {
                    let notified = self.inner.drained.notified();
                    if self.inner.pending.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    notified.await;
                }
            };
            if tokio::time::timeout(self.inner.lame_duck_period, drain)
                .await
                .is_err()
            {
                warn!(
                    remaining = self.inner.pending.load(Ordering::Acquire),
                    "lame duck period expired with work still pending"
                );
            }
        }
        let callbacks = std::mem::take(&mut *self.inner.shutdown_callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test]
    async fn refuses_work_after_shutdown_starts() {
        let lifecycle = Lifecycle::new(Duration::from_millis(50));
        let guard = lifecycle.start_work().unwrap();
        drop(guard);
        lifecycle.shutdown().await;
        assert!(lifecycle.start_work().is_none());
    }

    #[tokio::test]
    async fn drains_pending_work_then_fires_callbacks() {
        let lifecycle = Lifecycle::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        lifecycle.on_shutdown(move || fired2.store(true, Ordering::SeqCst));

        let guard = lifecycle.start_work().unwrap();
        let lc = lifecycle.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        lifecycle.shutdown().await;
        handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn lame_duck_period_bounds_the_drain() {
        let lifecycle = Lifecycle::new(Duration::from_millis(20));
        let _stuck = lifecycle.start_work().unwrap();
        // The guard is never dropped; shutdown must still return.
        lifecycle.shutdown().await;
        assert!(lifecycle.is_shutting_down());
    }
}
