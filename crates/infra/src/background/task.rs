//! [`BackgroundTask`]: run one piece of work later without queueing it.
//!
//! No retry, no capacity limit. Async work flagged `in_thread` is handed to an
//! isolated runtime and the caller gets [`TaskOutcome::Queued`] immediately.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info};

use conveyor_core::TaskId;

use super::executor::Executor;
use super::queue::WorkItem;
use super::types::{TaskError, TaskOutcome};

#[derive(Debug)]
pub struct BackgroundTask {
    id: TaskId,
    item: WorkItem,
    in_thread: bool,
    executor: Executor,
}

impl BackgroundTask {
    pub fn new(item: impl Into<WorkItem>) -> Self {
        let item = item.into();
        Self {
            id: item.id(),
            item,
            in_thread: false,
            executor: Executor::new("background-task", 1),
        }
    }

    /// Detach async work onto an isolated runtime; `run` returns at once.
    pub fn in_thread(mut self, enabled: bool) -> Self {
        self.in_thread = enabled;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub async fn run(self) -> TaskOutcome {
        let id = self.id;
        match self.item {
            WorkItem::Wrapped(wrapper) => wrapper.call().await,
            WorkItem::Blocking { name, f, .. } => {
                let result = self
                    .executor
                    .run_blocking(move || f())
                    .await
                    .and_then(|r| r.map_err(TaskError::from));
                finish(id, &name, result)
            }
            WorkItem::Async { name, f, .. } if self.in_thread => {
                let executor = self.executor;
                tokio::spawn(async move {
                    let result = executor
                        .run_isolated(move || f())
                        .await
                        .and_then(|r| r.map_err(TaskError::from));
                    finish(id, &name, result);
                });
                TaskOutcome::Queued
            }
            WorkItem::Async { name, f, .. } => {
                let result = match AssertUnwindSafe(f()).catch_unwind().await {
                    Ok(r) => r.map_err(TaskError::from),
                    Err(panic) => Err(TaskError::from_panic(panic)),
                };
                finish(id, &name, result)
            }
        }
    }

    /// Start running on the shared runtime without waiting for it.
    pub fn spawn(self) -> JoinHandle<TaskOutcome> {
        tokio::spawn(self.run())
    }
}

fn finish(id: TaskId, name: &str, result: Result<serde_json::Value, TaskError>) -> TaskOutcome {
    match &result {
        Ok(_) => info!(task_id = %id, task = name, "background task finished"),
        Err(e) => error!(task_id = %id, task = name, error = %e, "background task failed"),
    }
    TaskOutcome::from(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::types::Callable;
    use crate::background::wrapper::TaskWrapper;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn blocking_work_runs_off_the_runtime() {
        let task = BackgroundTask::new(Callable::blocking("sum", || Ok(json!(2 + 2))));
        assert_eq!(task.run().await, TaskOutcome::Done { result: json!(4) });
    }

    #[tokio::test]
    async fn async_work_is_awaited_inline() {
        let task = BackgroundTask::new(Callable::from_async("inline", || async {
            Err(anyhow::anyhow!("nope"))
        }));
        assert!(task.run().await.is_failed());
    }

    #[tokio::test]
    async fn in_thread_is_fire_and_forget() {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let task = BackgroundTask::new(Callable::from_async("detached", move || {
            let tx = tx.lock().unwrap().take();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(tx) = tx {
                    let _ = tx.send("ran");
                }
                Ok(Value::Null)
            }
        }))
        .in_thread(true);

        assert_eq!(task.run().await, TaskOutcome::Queued);
        let ran = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(ran, "ran");
    }

    #[tokio::test]
    async fn wrapper_is_called_directly() {
        let wrapper = TaskWrapper::new(Callable::blocking("w", || Ok(json!("w"))));
        let id = wrapper.id();
        let task = BackgroundTask::new(wrapper);
        assert_eq!(task.id(), id);
        let outcome = task.spawn().await.unwrap();
        assert_eq!(outcome, TaskOutcome::Done { result: json!("w") });
    }
}
