//! Bounded worker pool
//!
//! Jobs run as tokio tasks. A semaphore caps how many run at once; a job
//! waiting for a permit keeps its lease, so the session is not handed out
//! twice in the meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::trace;

use super::worker::{Job, WorkerContext};

/// Pool of I/O jobs sharing one [`WorkerContext`]
#[derive(Clone)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    ctx: Arc<WorkerContext>,
    max_workers: usize,
    submitted: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(runtime: Handle, max_workers: usize, ctx: Arc<WorkerContext>) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_workers)),
            ctx,
            max_workers,
            submitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `job` as soon as a permit is free
    pub fn submit(&self, job: Job) {
        let permits = Arc::clone(&self.permits);
        let ctx = Arc::clone(&self.ctx);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.runtime.spawn(async move {
            // Closed pool: dropping the job releases its lease
            let Ok(_permit) = permits.acquire_owned().await else {
                trace!("Worker pool closed, job dropped");
                return;
            };
            job.run(&ctx).await;
        });
    }

    /// Jobs currently holding a permit
    pub fn active(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Total jobs submitted so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Refuse further jobs; queued ones are dropped
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("active", &self.active())
            .field("submitted", &self.submitted())
            .finish_non_exhaustive()
    }
}
