//! Queue + tracker facade: submit work and look up its status later.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use conveyor_core::{ErrorKind, QueueError, TaskId};

use super::queue::BackgroundQueue;
use super::tracker::{JobRecord, JobState, JobTracker, TrackerError};
use super::types::Callable;
use super::wrapper::TaskWrapper;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Queue(e) => e.kind(),
            ServiceError::Tracker(e) => e.kind(),
        }
    }
}

#[derive(Clone)]
pub struct BackgroundService {
    queue: Arc<BackgroundQueue>,
    tracker: Arc<dyn JobTracker>,
}

impl BackgroundService {
    pub fn new(queue: Arc<BackgroundQueue>, tracker: Arc<dyn JobTracker>) -> Self {
        Self { queue, tracker }
    }

    pub fn queue(&self) -> &Arc<BackgroundQueue> {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<dyn JobTracker> {
        &self.tracker
    }

    /// Track and enqueue `callable`, starting after `jitter` seconds at most.
    pub async fn submit(&self, callable: Callable, jitter: f64) -> Result<JobRecord, ServiceError> {
        self.submit_wrapper(TaskWrapper::new(callable).with_jitter(jitter), JobRecord::new)
            .await
    }

    /// Like [`submit`](Self::submit) with attributes searchable through
    /// [`JobTracker::find_jobs`].
    pub async fn submit_with(
        &self,
        wrapper: TaskWrapper,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<JobRecord, ServiceError> {
        self.submit_wrapper(wrapper, move |name| {
            let mut record = JobRecord::new(name);
            record.attributes = attributes;
            record
        })
        .await
    }

    async fn submit_wrapper<F>(&self, wrapper: TaskWrapper, make: F) -> Result<JobRecord, ServiceError>
    where
        F: FnOnce(String) -> JobRecord + Send,
    {
        let mut record = make(wrapper.name().to_string());
        record.task_id = wrapper.id();
        let record = self.tracker.create_job(record).await?;
        let wrapper = wrapper.with_tracker(self.tracker.clone());

        if let Err(e) = self.queue.put(wrapper).await {
            warn!(task_id = %record.task_id, error = %e, "could not enqueue tracked task");
            if let Err(te) = self.tracker.set_failed(record.task_id, &e.to_string()).await {
                warn!(task_id = %record.task_id, error = %te, "failed to record rejection");
            }
            return Err(e.into());
        }

        info!(task_id = %record.task_id, task = %record.name, "task submitted");
        Ok(record)
    }

    pub async fn status(&self, task_id: TaskId) -> Result<Option<JobState>, ServiceError> {
        Ok(self.tracker.status(task_id).await?.map(|r| r.status))
    }

    pub async fn record(&self, task_id: TaskId) -> Result<Option<JobRecord>, ServiceError> {
        Ok(self.tracker.status(task_id).await?)
    }
}
