//! In-process background queue.
//!
//! ## Design
//!
//! - Bounded: `put` fails fast with [`QueueError::Full`] instead of waiting
//! - Exactly `workers` worker loops, each processing items in dequeue order
//! - One execution strategy per [`WorkItem`] variant, chosen by `match`
//! - A failing or panicking task never ends its worker; the completion hook
//!   runs once per dequeued item and `task_done` always follows
//! - Shutdown is idempotent: queued items are discarded, the running ones get
//!   a bounded grace period, then one sentinel per worker ends the loops

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_core::config::{env_flag, env_or, env_secs, env_var};
use conveyor_core::{QueueError, TaskId, WorkQueue};

use super::callbacks::{CompletionHook, DEFAULT_HOOK, LoggingHook};
use super::executor::Executor;
use super::profiling::ResourceProbe;
use super::types::{AsyncFn, BlockingFn, Callable, TaskError, TaskInfo, TaskOutcome};
use super::wrapper::TaskWrapper;

/// One unit of deferred work.
#[derive(Clone)]
pub enum WorkItem {
    /// Runs through [`TaskWrapper::call`] (jitter, callback, tracker, retries).
    Wrapped(TaskWrapper),
    /// Runs on the queue's bounded executor.
    Blocking { id: TaskId, name: String, f: BlockingFn },
    /// Runs on the shared runtime, or isolated when `coro_in_threads` is set.
    Async { id: TaskId, name: String, f: AsyncFn },
}

impl WorkItem {
    pub fn id(&self) -> TaskId {
        match self {
            WorkItem::Wrapped(w) => w.id(),
            WorkItem::Blocking { id, .. } | WorkItem::Async { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WorkItem::Wrapped(w) => w.name(),
            WorkItem::Blocking { name, .. } | WorkItem::Async { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Wrapped(_) => "wrapped",
            WorkItem::Blocking { .. } => "blocking",
            WorkItem::Async { .. } => "async",
        }
    }
}

impl From<TaskWrapper> for WorkItem {
    fn from(wrapper: TaskWrapper) -> Self {
        WorkItem::Wrapped(wrapper)
    }
}

impl From<Callable> for WorkItem {
    fn from(callable: Callable) -> Self {
        let id = TaskId::new();
        match callable {
            Callable::Blocking { name, f } => WorkItem::Blocking { id, name, f },
            Callable::Async { name, f } => WorkItem::Async { id, name, f },
        }
    }
}

impl core::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

enum QueueMessage {
    Work(WorkItem),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub workers: usize,
    pub executor_threads: usize,
    pub coro_in_threads: bool,
    pub profiling: bool,
    /// Pause after every accepted `put`, letting workers catch up.
    pub put_delay: Duration,
    pub shutdown_timeout: Duration,
    /// Registry key of the completion hook.
    pub callback: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            workers: 4,
            executor_threads: 4,
            coro_in_threads: false,
            profiling: false,
            put_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            callback: DEFAULT_HOOK.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_size: env_or("BACKGROUND_QUEUE_SIZE", d.max_size),
            workers: env_or("BACKGROUND_QUEUE_WORKERS", d.workers),
            executor_threads: env_or("BACKGROUND_EXECUTOR_THREADS", d.executor_threads),
            coro_in_threads: env_flag("BACKGROUND_CORO_IN_THREADS", d.coro_in_threads),
            profiling: env_flag("BACKGROUND_QUEUE_PROFILING", d.profiling),
            put_delay: d.put_delay,
            shutdown_timeout: env_secs("BACKGROUND_SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout),
            callback: env_var("BACKGROUND_QUEUE_CALLBACK").unwrap_or(d.callback),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_executor_threads(mut self, threads: usize) -> Self {
        self.executor_threads = threads;
        self
    }

    pub fn with_coro_in_threads(mut self, enabled: bool) -> Self {
        self.coro_in_threads = enabled;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

struct Shared {
    queue: WorkQueue<QueueMessage>,
    executor: Executor,
    hook: Arc<dyn CompletionHook>,
    probe: Option<ResourceProbe>,
    coro_in_threads: bool,
}

/// Bounded queue drained by a fixed pool of async workers.
pub struct BackgroundQueue {
    config: QueueConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl BackgroundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_hook(config, Arc::new(LoggingHook))
    }

    pub fn with_hook(config: QueueConfig, hook: Arc<dyn CompletionHook>) -> Self {
        let shared = Shared {
            queue: WorkQueue::new(config.max_size),
            executor: Executor::new("background-executor", config.executor_threads),
            hook,
            probe: config.profiling.then(ResourceProbe::new),
            coro_in_threads: config.coro_in_threads,
        };
        Self {
            config,
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Items waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.shared.queue.is_full()
    }

    /// Worker loops that have not terminated yet.
    pub fn running_workers(&self) -> usize {
        self.lock_workers()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Enqueue without waiting; fails fast when full or shut down.
    pub fn try_put(&self, item: impl Into<WorkItem>) -> Result<TaskId, QueueError> {
        let item = item.into();
        let id = item.id();
        self.shared.queue.try_put(QueueMessage::Work(item))?;
        debug!(task_id = %id, queued = self.len(), "task queued");
        Ok(id)
    }

    /// [`try_put`](Self::try_put) followed by the configured `put_delay`.
    pub async fn put(&self, item: impl Into<WorkItem>) -> Result<TaskId, QueueError> {
        let id = self.try_put(item)?;
        if !self.config.put_delay.is_zero() {
            tokio::time::sleep(self.config.put_delay).await;
        }
        Ok(id)
    }

    /// Launch the worker loops. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.config.workers.max(1);
        let mut workers = self.lock_workers();
        for worker in 0..count {
            let shared = self.shared.clone();
            workers.push(tokio::spawn(worker_loop(shared, worker)));
        }
        info!(
            workers = count,
            capacity = self.capacity(),
            executor_threads = self.shared.executor.threads(),
            "background queue started"
        );
    }

    /// Stop the queue. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("background queue already stopped");
            return;
        }
        let queue = &self.shared.queue;
        queue.close();

        let mut discarded = 0usize;
        for message in queue.drain() {
            if let QueueMessage::Work(item) = message {
                debug!(task_id = %item.id(), task = item.name(), "discarding queued task");
                discarded += 1;
                queue.task_done();
            }
        }
        if discarded > 0 {
            warn!(discarded, "queued background tasks discarded at shutdown");
        }

        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, queue.join()).await.is_err() {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "background tasks still running at shutdown, forcing stop"
            );
        }

        let workers = std::mem::take(&mut *self.lock_workers());
        for _ in &workers {
            queue.push_control(QueueMessage::Shutdown);
        }
        for mut handle in workers {
            if tokio::time::timeout(Duration::from_millis(100), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                let _ = handle.await;
            }
        }

        self.shared.executor.shutdown(timeout).await;
        info!("background queue stopped");
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for BackgroundQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackgroundQueue")
            .field("config", &self.config)
            .field("queued", &self.len())
            .field("running_workers", &self.running_workers())
            .finish()
    }
}

struct DoneGuard<'a>(&'a WorkQueue<QueueMessage>);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.task_done();
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "background worker started");
    while let Some(message) = shared.queue.get().await {
        let item = match message {
            QueueMessage::Work(item) => item,
            QueueMessage::Shutdown => break,
        };
        let _done = DoneGuard(&shared.queue);
        process(&shared, worker, item).await;
    }
    debug!(worker, "background worker stopped");
}

async fn process(shared: &Shared, worker: usize, item: WorkItem) {
    let info = TaskInfo {
        task_id: item.id(),
        name: item.name().to_string(),
        kind: item.kind(),
        worker,
    };

    let rss_before = shared.probe.as_ref().and_then(ResourceProbe::rss_bytes);
    let started = Instant::now();

    let (outcome, retry) = dispatch(shared, item).await;

    let profile = match (&shared.probe, rss_before) {
        (Some(probe), Some(before)) => probe.profile(before, started.elapsed()),
        _ => None,
    };
    if shared.probe.is_some() && profile.is_none() {
        debug!(task_id = %info.task_id, "resource profile unavailable");
    }

    let hooked = AssertUnwindSafe(shared.hook.on_complete(&info, &outcome, profile.as_ref()))
        .catch_unwind()
        .await;
    match hooked {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(task_id = %info.task_id, error = %format!("{e:#}"), "completion callback failed")
        }
        Err(panic) => error!(
            task_id = %info.task_id,
            error = %TaskError::from_panic(panic),
            "completion callback panicked"
        ),
    }

    if let Some(mut wrapper) = retry {
        let delay = wrapper.schedule_retry();
        info!(
            task_id = %info.task_id,
            attempt = wrapper.retries_done(),
            delay_ms = delay.as_millis() as u64,
            "retrying background task"
        );
        tokio::time::sleep(delay).await;
        if let Err(e) = shared.queue.try_put(QueueMessage::Work(WorkItem::Wrapped(wrapper))) {
            error!(task_id = %info.task_id, error = %e, "could not requeue task for retry");
        }
    }
}

async fn dispatch(shared: &Shared, item: WorkItem) -> (TaskOutcome, Option<TaskWrapper>) {
    match item {
        WorkItem::Wrapped(wrapper) => {
            let outcome = wrapper.call().await;
            let retry = (outcome.is_failed() && wrapper.can_retry()).then_some(wrapper);
            (outcome, retry)
        }
        WorkItem::Blocking { f, .. } => {
            let result = shared
                .executor
                .run_blocking(move || f())
                .await
                .and_then(|r| r.map_err(TaskError::from));
            (log_failure(result), None)
        }
        WorkItem::Async { f, .. } => {
            let result = if shared.coro_in_threads {
                shared.executor.run_isolated(move || f()).await
            } else {
                tokio::spawn(f()).await.map_err(TaskError::from_join)
            };
            (log_failure(result.and_then(|r| r.map_err(TaskError::from))), None)
        }
    }
}

fn log_failure(result: Result<Value, TaskError>) -> TaskOutcome {
    if let Err(e) = &result {
        error!(error = %e, kind = %e.kind(), "background task raised");
    }
    TaskOutcome::from(result)
}
