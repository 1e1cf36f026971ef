//! Units of work, their outcomes and completion callbacks.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use conveyor_core::{ErrorKind, TaskId};

/// Synchronous callable. Arguments are captured by the closure.
pub type BlockingFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// Asynchronous callable producing a fresh future per invocation.
pub type AsyncFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("executor unavailable: {0}")]
    Executor(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CallableFailure
    }

    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked(message)
    }

    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            Self::from_panic(err.into_panic())
        } else {
            TaskError::Cancelled
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(format!("{err:#}"))
    }
}

/// Result handed to callbacks, trackers and the completion hook.
///
/// Serializes as `{"status":"done","result":..}`, `{"status":"failed","error":..}`
/// or `{"status":"queued"}` for fire-and-forget runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Done { result: Value },
    Failed { error: String },
    Queued,
}

impl TaskOutcome {
    pub fn failed(err: &TaskError) -> Self {
        TaskOutcome::Failed {
            error: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            TaskOutcome::Done { .. } => "done",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::Queued => "queued",
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Result<Value, TaskError>> for TaskOutcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(result) => TaskOutcome::Done { result },
            Err(err) => TaskOutcome::failed(&err),
        }
    }
}

/// A named callable, sync or async.
#[derive(Clone)]
pub enum Callable {
    Blocking { name: String, f: BlockingFn },
    Async { name: String, f: AsyncFn },
}

impl Callable {
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Callable::Blocking {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn from_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Callable::Async {
            name: name.into(),
            f: Arc::new(move || Box::pin(f())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Callable::Blocking { name, .. } | Callable::Async { name, .. } => name,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Callable::Async { .. })
    }
}

impl core::fmt::Debug for Callable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = if self.is_async() { "async" } else { "blocking" };
        f.debug_struct("Callable")
            .field("name", &self.name())
            .field("kind", &kind)
            .finish()
    }
}

/// Per-task post-execution hook.
#[derive(Clone)]
pub enum TaskCallback {
    Sync(Arc<dyn Fn(&TaskOutcome) -> anyhow::Result<()> + Send + Sync>),
    Async(Arc<dyn Fn(TaskOutcome) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>),
}

impl TaskCallback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&TaskOutcome) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskCallback::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskOutcome) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        TaskCallback::Async(Arc::new(move |outcome| Box::pin(f(outcome))))
    }

    pub async fn invoke(&self, outcome: &TaskOutcome) -> anyhow::Result<()> {
        match self {
            TaskCallback::Sync(f) => f(outcome),
            TaskCallback::Async(f) => f(outcome.clone()).await,
        }
    }
}

impl core::fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TaskCallback::Sync(_) => f.write_str("TaskCallback::Sync"),
            TaskCallback::Async(_) => f.write_str("TaskCallback::Async"),
        }
    }
}

/// What the completion hook knows about a finished task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub kind: &'static str,
    pub worker: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_payload_shape() {
        let outcome = TaskOutcome::failed(&TaskError::Failed("boom".into()));
        assert_eq!(outcome.to_json(), json!({"status": "failed", "error": "boom"}));

        let done = TaskOutcome::from(Ok(json!(3)));
        assert_eq!(done.to_json(), json!({"status": "done", "result": 3}));
    }

    #[test]
    fn anyhow_context_is_kept() {
        let err = anyhow::anyhow!("boom").context("loading report");
        assert_eq!(TaskError::from(err), TaskError::Failed("loading report: boom".into()));
    }

    #[tokio::test]
    async fn callbacks_of_both_flavours() {
        let sync = TaskCallback::sync(|o| {
            assert_eq!(o.status(), "queued");
            Ok(())
        });
        sync.invoke(&TaskOutcome::Queued).await.unwrap();

        let failing = TaskCallback::from_async(|_| async { Err(anyhow::anyhow!("nope")) });
        assert!(failing.invoke(&TaskOutcome::Queued).await.is_err());
    }
}
