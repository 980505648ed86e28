//! Shared worker pool.
//!
//! One pool per process, owned by [`crate::Database`] and used by every
//! cache for off-path work (async saves, refresh loads). A semaphore bounds
//! concurrency; shutdown drains with a bounded wait and then aborts whatever
//! is left.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub struct WorkerPool {
    tasks: Mutex<JoinSet<()>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue `work`; returns false if the pool is shut down.
    pub fn spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Worker pool is shut down; dropping task");
            return false;
        }
        let permits = Arc::clone(&self.permits);
        let mut tasks = self.tasks.lock();
        // Reap finished tasks so the set does not grow unbounded
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
        true
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait up to `timeout` for in-flight tasks.
    ///
    /// Returns true if everything drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let pending = tasks.len();

        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            debug!(pending, "Worker pool drained");
        } else {
            warn!(
                remaining = tasks.len(),
                "Worker pool did not drain within {:?}; abandoning remaining tasks", timeout
            );
            tasks.abort_all();
        }
        drained
    }
}
