//! Bounded pool for CPU-heavy and blocking work.
//!
//! Transcription backends run model inference and file decoding through
//! here so a burst of tasks cannot pile unbounded threads onto the
//! runtime's blocking pool. Permits gate admission; the permit is held for
//! the whole job, not just the spawn.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;
use tracing::debug;

pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    /// A pool admitting `size` concurrent jobs, minimum one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a permit frees up. Errors only
    /// when the job panics.
    pub async fn run<T, F>(&self, job: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("blocking pool semaphore closed")?;
        debug!(
            available = self.permits.available_permits(),
            "Blocking job admitted"
        );
        let output = tokio::task::spawn_blocking(move || {
            let output = job();
            drop(permit);
            output
        })
        .await
        .context("blocking job panicked")?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn returns_the_job_output() {
        let pool = BlockingPool::new(2);
        let answer = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(answer, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn zero_size_is_clamped_to_one() {
        let pool = BlockingPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.run(|| "still runs").await.unwrap(), "still runs");
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_pool_size() {
        let pool = Arc::new(BlockingPool::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            jobs.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(25));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for job in jobs {
            job.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn panicking_job_surfaces_as_an_error_and_frees_the_permit() {
        let pool = BlockingPool::new(1);
        let failed = pool.run(|| panic!("boom")).await;
        assert!(failed.is_err());
        // the permit must come back even though the job died
        assert_eq!(pool.run(|| 7).await.unwrap(), 7);
    }
}
