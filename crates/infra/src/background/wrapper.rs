//! [`TaskWrapper`]: one callable plus everything needed to run it once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, error, warn};

use conveyor_core::TaskId;

use super::executor::Executor;
use super::tracker::JobTracker;
use super::types::{Callable, TaskCallback, TaskError, TaskOutcome};

/// Lower bound of the random start delay, in seconds.
pub const MIN_JITTER_SECS: f64 = 0.1;

/// A callable with optional jitter, callback, tracker and retry budget.
///
/// Calling it never fails: errors and panics are logged and turned into a
/// [`TaskOutcome::Failed`] that is handed to the callback.
#[derive(Clone)]
pub struct TaskWrapper {
    id: TaskId,
    callable: Callable,
    callback: Option<TaskCallback>,
    jitter: f64,
    max_retries: u32,
    retry_delay: Duration,
    retries_done: u32,
    tracker: Option<Arc<dyn JobTracker>>,
    // Sync callables run here, off the async workers.
    executor: Executor,
}

impl core::fmt::Debug for TaskWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskWrapper")
            .field("id", &self.id)
            .field("callable", &self.callable)
            .field("jitter", &self.jitter)
            .field("retries_done", &self.retries_done)
            .field("max_retries", &self.max_retries)
            .field("tracked", &self.tracker.is_some())
            .finish()
    }
}

impl TaskWrapper {
    pub fn new(callable: Callable) -> Self {
        Self {
            id: TaskId::new(),
            callable,
            callback: None,
            jitter: 0.0,
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            retries_done: 0,
            tracker: None,
            executor: Executor::new("task-wrapper", 1),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Sleep a random `[0.1, jitter]` seconds before running. `0` disables it.
    pub fn with_jitter(mut self, jitter_secs: f64) -> Self {
        self.jitter = if jitter_secs.is_finite() { jitter_secs.max(0.0) } else { 0.0 };
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn JobTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn add_callback(&mut self, callback: TaskCallback) {
        self.callback = Some(callback);
    }

    pub fn with_callback(mut self, callback: TaskCallback) -> Self {
        self.add_callback(callback);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.callable.name()
    }

    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    pub fn retries_done(&self) -> u32 {
        self.retries_done
    }

    pub fn can_retry(&self) -> bool {
        self.retries_done < self.max_retries
    }

    /// Count one retry and return the delay before it should run:
    /// `retry_delay * retries_done * uniform(0.8, 1.2)`.
    pub fn schedule_retry(&mut self) -> Duration {
        self.retries_done += 1;
        let factor = rand::rng().random_range(0.8..=1.2);
        self.retry_delay
            .saturating_mul(self.retries_done)
            .mul_f64(factor)
    }

    fn start_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return Duration::ZERO;
        }
        if self.jitter <= MIN_JITTER_SECS {
            return Duration::from_secs_f64(self.jitter);
        }
        Duration::from_secs_f64(rand::rng().random_range(MIN_JITTER_SECS..=self.jitter))
    }

    /// Run the callable once and deliver the outcome to the callback.
    pub async fn call(&self) -> TaskOutcome {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.set_running(self.id).await {
                warn!(task_id = %self.id, error = %e, "failed to mark task running");
            }
        }

        let delay = self.start_delay();
        if !delay.is_zero() {
            debug!(task_id = %self.id, delay_ms = delay.as_millis() as u64, "jitter before task");
            tokio::time::sleep(delay).await;
        }

        let result = self.execute().await;

        if let Some(tracker) = &self.tracker {
            let tracked = match &result {
                Ok(value) => tracker.set_done(self.id, value.clone()).await,
                Err(err) => tracker.set_failed(self.id, &err.to_string()).await,
            };
            if let Err(e) = tracked {
                warn!(task_id = %self.id, error = %e, "failed to record task result");
            }
        }

        let outcome = TaskOutcome::from(result);
        if let TaskOutcome::Failed { error } = &outcome {
            error!(task_id = %self.id, task = self.name(), error = %error, "task failed");
        }

        if let Some(callback) = &self.callback {
            let delivered = AssertUnwindSafe(callback.invoke(&outcome)).catch_unwind().await;
            match delivered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(task_id = %self.id, error = %format!("{e:#}"), "task callback failed")
                }
                Err(panic) => error!(
                    task_id = %self.id,
                    error = %TaskError::from_panic(panic),
                    "task callback panicked"
                ),
            }
        }

        outcome
    }

    async fn execute(&self) -> Result<Value, TaskError> {
        match &self.callable {
            Callable::Async { f, .. } => match AssertUnwindSafe(f()).catch_unwind().await {
                Ok(result) => result.map_err(TaskError::from),
                Err(panic) => Err(TaskError::from_panic(panic)),
            },
            Callable::Blocking { f, .. } => {
                let f = Arc::clone(f);
                self.executor.run_blocking(move || f()).await?.map_err(TaskError::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::tracker::{InMemoryJobTracker, JobRecord, JobState};
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (TaskCallback, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = TaskCallback::sync(move |outcome| {
            sink.lock().unwrap().push(outcome.to_json());
            Ok(())
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn sync_callable_result_reaches_callback() {
        let (callback, seen) = recorder();
        let wrapper = TaskWrapper::new(Callable::blocking("add", || Ok(json!(1 + 2))))
            .with_callback(callback);

        let outcome = wrapper.call().await;

        assert_eq!(outcome, TaskOutcome::Done { result: json!(3) });
        assert_eq!(*seen.lock().unwrap(), vec![json!({"status": "done", "result": 3})]);
    }

    #[tokio::test]
    async fn failure_is_converted_not_raised() {
        let (callback, seen) = recorder();
        let wrapper = TaskWrapper::new(Callable::from_async("explode", || async {
            Err(anyhow::anyhow!("boom"))
        }))
        .with_callback(callback);

        let outcome = wrapper.call().await;

        assert!(outcome.is_failed());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!({"status": "failed", "error": "boom"})]
        );
    }

    #[tokio::test]
    async fn panicking_callable_and_callback_are_contained() {
        let wrapper = TaskWrapper::new(Callable::blocking("panics", || panic!("bad input")))
            .with_callback(TaskCallback::sync(|_| panic!("callback bug")));

        let outcome = wrapper.call().await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                error: "task panicked: bad input".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_delays_start() {
        let wrapper = TaskWrapper::new(Callable::from_async("noop", || async { Ok(Value::Null) }))
            .with_jitter(2.0);

        let started = tokio::time::Instant::now();
        wrapper.call().await;
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(100));
        assert!(waited <= Duration::from_secs(2) + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn tracker_sees_final_state() {
        let tracker = Arc::new(InMemoryJobTracker::new());
        let record = tracker.create_job(JobRecord::new("ok")).await.unwrap();
        let wrapper = TaskWrapper::new(Callable::blocking("ok", || Ok(json!("fine"))))
            .with_id(record.task_id)
            .with_tracker(tracker.clone());

        wrapper.call().await;

        let stored = tracker.status(record.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Done);
        assert_eq!(stored.result, Some(json!("fine")));
    }

    #[test]
    fn retry_delay_grows_with_attempts() {
        let mut wrapper = TaskWrapper::new(Callable::blocking("x", || Ok(Value::Null)))
            .with_retries(2, Duration::from_secs(10));

        assert!(wrapper.can_retry());
        let first = wrapper.schedule_retry();
        assert!(first >= Duration::from_secs(8) && first <= Duration::from_secs(12));
        let second = wrapper.schedule_retry();
        assert!(second >= Duration::from_secs(16) && second <= Duration::from_secs(24));
        assert!(!wrapper.can_retry());
    }
}
