//! Resource governors: "at most K concurrent" per named resource.
//!
//! A [`ResourceConstraint`] combines a counting semaphore, a set of spawned
//! tasks to wait on, and a first-error recorder. The multi-resource variant
//! gates each step of a task on a named token; permits may be released in
//! any order (dropping a permit returns it, regardless of acquisition
//! order).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use oxherd_errors::{internal_err, OxherdError, OxherdResult};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::recorder::{ErrorRecorder, FirstErrorRecorder};

/// Bounds the concurrency of a batch of spawned tasks and collects their
/// first error.
pub struct ResourceConstraint {
    semaphore: Arc<Semaphore>,
    recorder: Arc<FirstErrorRecorder>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceConstraint {
    pub fn new(concurrency: usize) -> Self {
        ResourceConstraint {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            recorder: Arc::new(FirstErrorRecorder::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Wait for a concurrency slot.
    pub async fn acquire(&self) -> OxherdResult<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| internal_err!("constraint semaphore closed"))
    }

    /// Spawn a governed task. The task should acquire a slot itself if it
    /// needs one for only part of its runtime.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = OxherdResult<()>> + Send + 'static,
    {
        let recorder = Arc::clone(&self.recorder);
        let handle = tokio::spawn(async move {
            recorder.record(fut.await);
        });
        self.handles.lock().push(handle);
    }

    pub fn record_error(&self, err: OxherdError) {
        self.recorder.record_error(err);
    }

    pub fn has_errors(&self) -> bool {
        self.recorder.has_errors()
    }

    /// Wait for every spawned task, then return the first recorded error.
    pub async fn wait(&self) -> OxherdResult<()> {
        loop {
            let handle = self.handles.lock().pop();
            match handle {
                Some(h) => {
                    if let Err(e) = h.await {
                        self.recorder
                            .record_error(OxherdError::Fatal(format!("task panicked: {e}")));
                    }
                }
                None => break,
            }
        }
        match self.recorder.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Like [`ResourceConstraint`], but with several named semaphores so one
/// task can hold, say, a network token and a db token at different times.
pub struct MultiResourceConstraint {
    semaphores: HashMap<String, Arc<Semaphore>>,
    recorder: Arc<FirstErrorRecorder>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiResourceConstraint {
    pub fn new(concurrencies: HashMap<String, usize>) -> Self {
        let semaphores = concurrencies
            .into_iter()
            .map(|(name, n)| (name, Arc::new(Semaphore::new(n))))
            .collect();
        MultiResourceConstraint {
            semaphores,
            recorder: Arc::new(FirstErrorRecorder::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Wait for a token of the named resource. Unknown names are an
    /// internal error: the map is fixed at construction.
    pub async fn acquire(&self, name: &str) -> OxherdResult<OwnedSemaphorePermit> {
        let sem = self
            .semaphores
            .get(name)
            .ok_or_else(|| internal_err!("no resource named {name} in semaphore map"))?;
        sem.clone()
            .acquire_owned()
            .await
            .map_err(|_| internal_err!("constraint semaphore closed"))
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = OxherdResult<()>> + Send + 'static,
    {
        let recorder = Arc::clone(&self.recorder);
        let handle = tokio::spawn(async move {
            recorder.record(fut.await);
        });
        self.handles.lock().push(handle);
    }

    pub fn record_error(&self, err: OxherdError) {
        self.recorder.record_error(err);
    }

    /// Wait for every spawned task, then return the first recorded error.
    pub async fn wait(&self) -> OxherdResult<()> {
        loop {
            let handle = self.handles.lock().pop();
            match handle {
                Some(h) => {
                    if let Err(e) = h.await {
                        self.recorder
                            .record_error(OxherdError::Fatal(format!("task panicked: {e}")));
                    }
                }
                None => break,
            }
        }
        match self.recorder.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn constraint_bounds_concurrency() {
        let rc = Arc::new(ResourceConstraint::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let rc2 = Arc::clone(&rc);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            rc.spawn(async move {
                let _permit = rc2.acquire().await?;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        rc.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn wait_returns_first_error() {
        let rc = ResourceConstraint::new(4);
        rc.spawn(async { Err(OxherdError::Aborted("boom".into())) });
        rc.spawn(async { Ok(()) });
        assert_eq!(
            rc.wait().await,
            Err(OxherdError::Aborted("boom".into()))
        );
    }

    #[tokio::test]
    async fn multi_constraint_releases_out_of_order() {
        let mut caps = HashMap::new();
        caps.insert("net".to_string(), 1);
        caps.insert("db".to_string(), 1);
        let mrc = MultiResourceConstraint::new(caps);

        let net = mrc.acquire("net").await.unwrap();
        let db = mrc.acquire("db").await.unwrap();
        // Dropping in acquisition order is not required.
        drop(net);
        let net2 = mrc.acquire("net").await.unwrap();
        drop(db);
        drop(net2);

        assert!(mrc.acquire("disk").await.is_err());
    }
}
