//! Bounded background worker pool
//!
//! Network-bound work (connect, execute, cancel, introspect, discovery) runs
//! as tokio tasks, at most `permits` at a time, so the caller's flow never
//! waits on a backend. Cancel requests get their own small lane: they must
//! not queue behind the statements they are meant to stop.

use crate::error::{Result, VizdbError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Permits of the cancel lane
const CANCEL_PERMITS: usize = 2;

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    cancel_lane: Arc<Semaphore>,
    permits: usize,
}

impl WorkerPool {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            cancel_lane: Arc::new(Semaphore::new(CANCEL_PERMITS)),
            permits,
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Tasks currently running
    pub fn busy(&self) -> usize {
        self.permits - self.semaphore.available_permits()
    }

    /// Queue `task`; it starts once a permit is free
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        gated(self.semaphore.clone(), task)
    }

    /// Run `task` on the pool and wait for its result
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        joined(self.spawn(task)).await
    }

    /// Run a cancel request on the cancel lane, which running statements
    /// never occupy
    pub async fn run_cancel<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        joined(gated(self.cancel_lane.clone(), task)).await
    }
}

fn gated<F, T>(semaphore: Arc<Semaphore>, task: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        // The semaphore is never closed, so acquiring only waits
        let _permit = semaphore.acquire_owned().await.ok();
        task.await
    })
}

async fn joined<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(|e| {
        VizdbError::Io(std::io::Error::other(format!("worker task failed: {}", e)))
    })?
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}
