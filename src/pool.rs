//! Bounded worker pool for CPU-bound handlers.
//!
//! Jobs run on tokio's blocking thread pool so that a slow handler never stalls
//! the tasks servicing other calls. A semaphore caps how many jobs run at once;
//! further submissions wait for a free slot.
//!
//! # Configuration
//!
//! - `size`: maximum concurrently running jobs
//!   (default: available parallelism minus one, at least 1)

use std::any::Any;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{LeafwireError, Result};

/// Bounded pool of blocking worker threads.
///
/// Cheap to clone; clones share the same slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs at once (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Default pool size: one fewer than the available processing units, minimum 1.
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    /// Maximum number of concurrently running jobs.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of free slots.
    #[inline]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run `job` on a worker thread and await its result.
    ///
    /// The slot stays occupied until the job returns, even if the caller stops
    /// waiting (for example when a handler timeout fires).
    ///
    /// # Errors
    ///
    /// - [`LeafwireError::WorkerPanicked`] if the job panicked
    /// - [`LeafwireError::PoolClosed`] if the pool was closed or the job cancelled
    pub async fn submit<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LeafwireError::PoolClosed)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        handle.await.map_err(|e| {
            if e.is_panic() {
                LeafwireError::WorkerPanicked(panic_message(e.into_panic().as_ref()))
            } else {
                LeafwireError::PoolClosed
            }
        })
    }

    /// Stop accepting jobs. Running jobs finish normally.
    pub fn close(&self) {
        self.slots.close();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_default_size_is_at_least_one() {
        assert!(WorkerPool::default_size() >= 1);
        assert_eq!(WorkerPool::new(0).size(), 1);
    }

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = WorkerPool::new(2);
        let sum = pool.submit(|| (1..=10).sum::<u64>()).await.unwrap();
        assert_eq!(sum, 55);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let pool = WorkerPool::new(1);
        let result = pool.submit(|| -> u32 { panic!("boom") }).await;

        match result {
            Err(LeafwireError::WorkerPanicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected panic error, got {:?}", other),
        }

        // The slot is released after the panic.
        assert_eq!(pool.submit(|| 7).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });

        for result in futures::future::join_all(jobs).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_jobs() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(matches!(
            pool.submit(|| 1).await,
            Err(LeafwireError::PoolClosed)
        ));
    }

    #[test]
    fn test_panic_message_payloads() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(text.as_ref()), "static");

        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
