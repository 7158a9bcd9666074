//! WorkerPool - Bounded execution resource for invocation tasks
//!
//! Task-based counterpart of a bounded thread pool: a semaphore caps how many
//! submitted tasks run at once, and admission stops once running plus queued
//! tasks reach `max_size + queue_capacity`. Submission never blocks; it
//! either accepts the task or fails fast.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use courier_common::{PoolSnapshot, PoolSpec};

/// Submission outcome when the pool cannot take the task.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Running + queued tasks already fill `max_size + queue_capacity`.
    #[error("pool {0} queue is full")]
    QueueFull(String),
    /// The pool was retired and no longer accepts work.
    #[error("pool {0} is shut down")]
    Stopped(String),
}

/// A named worker pool with a bounded task queue and live occupancy counters.
///
/// Always handled as `Arc<WorkerPool>`; spawned tasks hold a clone, so a
/// retired pool's resources are released only once its remaining tasks exit,
/// which is the retirement contract (stop accepting, let drain, never cancel).
pub struct WorkerPool {
    spec: PoolSpec,
    semaphore: Arc<Semaphore>,
    accepting: AtomicBool,
    /// Accepted tasks not yet finished: queued + running.
    in_flight: AtomicUsize,
    active: AtomicUsize,
    largest: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl WorkerPool {
    pub fn new(spec: PoolSpec) -> Arc<Self> {
        debug!(
            pool = %spec.name,
            core = spec.core_size,
            max = spec.max_size,
            queue_capacity = spec.queue_capacity,
            "created worker pool"
        );
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(spec.max_size)),
            spec,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            largest: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }

    /// Accept a task or fail fast. Never blocks the caller: the task is
    /// spawned and waits for an execution permit inside the pool.
    pub fn try_submit<F>(self: &Arc<Self>, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SubmitError::Stopped(self.spec.name.clone()));
        }

        // Reserve an in-flight slot; the bound covers running and queued work.
        let limit = self.spec.max_size + self.spec.queue_capacity;
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= limit {
                return Err(SubmitError::QueueFull(self.spec.name.clone()));
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match pool.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed; nothing ever closes it today, but the
                    // slot must be given back if that changes.
                    pool.in_flight.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };

            let running = pool.active.fetch_add(1, Ordering::AcqRel) + 1;
            pool.largest.fetch_max(running, Ordering::AcqRel);

            task.await;

            pool.completed.fetch_add(1, Ordering::Relaxed);
            pool.active.fetch_sub(1, Ordering::AcqRel);
            pool.in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });

        Ok(())
    }

    /// Stop accepting new submissions. Queued and running tasks finish in
    /// place.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!(pool = %self.spec.name, "worker pool shut down");
        }
    }

    /// Wait up to `grace` for all accepted work to finish. Returns whether
    /// the pool fully drained.
    pub async fn await_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    pub fn core_size(&self) -> usize {
        self.spec.core_size
    }

    pub fn max_size(&self) -> usize {
        self.spec.max_size
    }

    pub fn queue_capacity(&self) -> usize {
        self.spec.queue_capacity
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        in_flight.saturating_sub(self.active.load(Ordering::Acquire))
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Point-in-time occupancy counters. Task-based pools have no idle
    /// threads, so pool size tracks the active count.
    pub fn snapshot(&self) -> PoolSnapshot {
        let active = self.active();
        PoolSnapshot {
            name: self.spec.name.clone(),
            pool_size: active,
            active,
            core_size: self.spec.core_size,
            max_size: self.spec.max_size,
            largest: self.largest.load(Ordering::Acquire),
            submitted: self.submitted(),
            completed: self.completed(),
            queue_size: self.queue_size(),
            queue_capacity: self.spec.queue_capacity,
        }
    }
}

/// Retire a superseded pool: stop accepting, wait out the grace period, and
/// abandon whatever has not drained. A drain timeout is a warning, never
/// fatal; the leftover tasks run out naturally on their own permits.
pub async fn retire(pool: Arc<WorkerPool>, grace: Duration) {
    pool.shutdown();
    if !pool.await_idle(grace).await {
        warn!(
            pool = %pool.name(),
            grace_secs = grace.as_secs(),
            queue_size = pool.queue_size(),
            active = pool.active(),
            "retired pool did not drain within grace period, abandoning"
        );
    }
}
