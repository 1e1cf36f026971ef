//! Bounded pool for blocking callables and isolated async units.
//!
//! - At most `threads` units run at once; extra submissions wait for a permit
//! - `run_isolated` drives a future to completion on its own current-thread
//!   runtime inside the pool, so a misbehaving future cannot stall the shared
//!   runtime's cooperative scheduling
//! - `shutdown` waits (bounded) for running units, then refuses new ones

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::TaskError;

#[derive(Debug, Clone)]
pub struct Executor {
    name: &'static str,
    threads: usize,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(name: &'static str, threads: usize) -> Self {
        let threads = threads.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            name,
            threads,
            permits: Arc::new(Semaphore::new(threads)),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Units currently holding a slot.
    pub fn busy(&self) -> usize {
        self.threads.saturating_sub(self.permits.available_permits())
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    /// Run a blocking closure on the pool and await its result.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Executor(format!("{} is shut down", self.name)))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(TaskError::from_join)
    }

    /// Submit a run-to-completion async unit; the handle resolves with its output.
    pub fn spawn_isolated<F, Fut>(&self, make: F) -> JoinHandle<Result<Fut::Output, TaskError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        let executor = self.clone();
        tokio::spawn(async move {
            executor
                .run_blocking(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| TaskError::Executor(format!("isolated runtime: {e}")))?;
                    Ok(runtime.block_on(make()))
                })
                .await?
        })
    }

    pub async fn run_isolated<F, Fut>(&self, make: F) -> Result<Fut::Output, TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        self.spawn_isolated(make)
            .await
            .map_err(TaskError::from_join)?
    }

    /// Wait up to `timeout` for running units, then stop accepting work.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.is_shutdown() {
            return;
        }
        let all = u32::try_from(self.threads).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                debug!(executor = self.name, "executor idle");
            }
            Ok(Err(_)) => {}
            Err(_) => warn!(
                executor = self.name,
                busy = self.busy(),
                "executor still busy at shutdown"
            ),
        }
        self.permits.close();
    }
}
