//! Bounded pool for blocking work.
//!
//! The event-processing threads must never run application code or block on
//! disk. Work handed to a [`WorkerPool`] runs on tokio's blocking threads,
//! at most `size` jobs at a time per pool, and its result comes back through
//! a oneshot channel: exactly one send, exactly one receive.

use std::sync::Arc;

use tokio::sync::{Semaphore, oneshot};
use tracing::error;

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self { name, permits: Arc::new(Semaphore::new(size.max(1))) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `job` off the event loop and waits for its result without
    /// blocking the caller's thread.
    ///
    /// Fails with [`Error::WorkerPool`] if the job panicked.
    pub async fn run<F, T>(&self, job: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::WorkerPool)?;

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            // The receiver is only gone if the caller was cancelled.
            let _ = tx.send(job());
        });

        rx.await.map_err(|_| {
            error!(pool = self.name, "job dropped without a result");
            Error::WorkerPool
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_should_return_job_result() {
        let pool = WorkerPool::new("test", 2);
        let value = pool.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_should_report_panicking_job() {
        let pool = WorkerPool::new("test", 1);
        let result = pool.run(|| -> u8 { panic!("boom") }).await;
        assert!(matches!(result, Err(Error::WorkerPool)));
        // The permit is released, so the pool keeps working.
        assert_eq!(pool.run(|| 1).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_should_bound_concurrent_jobs() {
        let pool = WorkerPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            jobs.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for job in jobs {
            job.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
