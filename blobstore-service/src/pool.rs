//! Bounded worker pool for parallel upload tasks.
//!
//! [`WriterPool`] caps the number of concurrently running chunk uploads using a tokio semaphore.
//! Spawning waits for a free slot, so callers queue up instead of failing when the pool is
//! saturated. Each slot notifies waiters when it is returned, allowing
//! [`WriterPool::wait_idle`] to resolve once all tasks have finished.
//!
//! A process-wide instance is available through [`WriterPool::global`]. Storages use it unless
//! their [`StorageContext`](crate::config::StorageContext) injects a different pool.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Default number of concurrent tasks in the global pool.
pub const DEFAULT_WRITER_POOL_SIZE: usize = 100;

static GLOBAL_POOL: OnceLock<WriterPool> = OnceLock::new();

/// Limits concurrently running upload tasks.
///
/// Cloning the pool is cheap and shares the slots.
#[derive(Clone, Debug)]
pub struct WriterPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    released: Arc<Notify>,
}

impl WriterPool {
    /// Creates a new pool running at most `size` tasks at once.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            released: Arc::new(Notify::new()),
        }
    }

    /// Returns the process-wide pool, creating it on first use.
    pub fn global() -> &'static WriterPool {
        GLOBAL_POOL.get_or_init(|| {
            tracing::debug!(size = DEFAULT_WRITER_POOL_SIZE, "Creating global writer pool");
            WriterPool::new(DEFAULT_WRITER_POOL_SIZE)
        })
    }

    /// Initializes the process-wide pool with the given size.
    ///
    /// Returns `false` if the global pool has already been created, in which case its size is left
    /// unchanged.
    pub fn init_global(size: usize) -> bool {
        GLOBAL_POOL.set(WriterPool::new(size)).is_ok()
    }

    /// Returns the maximum number of concurrent tasks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of slots currently held by running tasks.
    pub fn used_slots(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    /// Runs `task` on the tokio runtime once a slot is free.
    ///
    /// The slot is released when the task completes or is cancelled.
    pub async fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|err| Error::unavailable("writer pool is closed", err))?;

        let slot = PoolSlot {
            permit: Some(permit),
            released: Arc::clone(&self.released),
        };

        Ok(tokio::spawn(async move {
            let _slot = slot;
            task.await
        }))
    }

    /// Waits until all slots have been returned.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.released.notified();
            if self.used_slots() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard for a pool slot.
///
/// Dropping this slot releases it back to the [`WriterPool`] and notifies any task waiting in
/// [`WriterPool::wait_idle`].
struct PoolSlot {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn runs_tasks_and_releases_slots() {
        let pool = WriterPool::new(2);
        assert_eq!(pool.used_slots(), 0);

        let handle = pool.spawn(async { 21 * 2 }).await.unwrap();
        assert_eq!(handle.await.unwrap(), 42);

        pool.wait_idle().await;
        assert_eq!(pool.used_slots(), 0);
    }

    #[tokio::test]
    async fn spawn_queues_when_saturated() {
        let pool = WriterPool::new(1);
        let (tx, rx) = oneshot::channel::<()>();

        let blocker = pool
            .spawn(async move {
                rx.await.ok();
            })
            .await
            .unwrap();
        assert_eq!(pool.used_slots(), 1);

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.spawn(async { "done" }).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        tx.send(()).unwrap();
        blocker.await.unwrap();

        let handle = queued.await.unwrap().unwrap();
        assert_eq!(handle.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn wait_idle_waits_for_running_tasks() {
        let pool = WriterPool::new(4);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let finished = Arc::clone(&finished);
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.wait_idle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn zero_size_still_runs() {
        assert_eq!(WriterPool::new(0).size(), 1);
    }
}
