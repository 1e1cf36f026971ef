//! Background work: wrapped callables, a bounded worker queue, and fire-and-forget tasks.
//!
//! ## Components
//!
//! - `TaskWrapper`: callable + jitter, retry budget, completion callback
//! - `BackgroundQueue`: bounded FIFO drained by a fixed set of workers
//! - `BackgroundTask`: run one item later without queueing it
//! - `JobTracker`: optional status records for submitted work
//! - `CompletionHook`: pluggable post-execution hook, resolved by name

pub mod callbacks;
pub mod executor;
pub mod profiling;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_tracker;
pub mod service;
pub mod task;
pub mod tracker;
pub mod types;
pub mod wrapper;

pub use callbacks::{CallbackRegistry, CompletionHook, DEFAULT_HOOK, HookFactory, LoggingHook};
pub use executor::Executor;
pub use profiling::{ResourceProbe, TaskProfile};
pub use queue::{BackgroundQueue, QueueConfig, WorkItem};
#[cfg(feature = "redis")]
pub use redis_tracker::RedisJobTracker;
pub use service::{BackgroundService, ServiceError};
pub use task::BackgroundTask;
pub use tracker::{InMemoryJobTracker, JobRecord, JobState, JobTracker, TrackerError};
pub use types::{Callable, TaskCallback, TaskError, TaskInfo, TaskOutcome};
pub use wrapper::TaskWrapper;
