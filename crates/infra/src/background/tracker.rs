//! Job status tracking for submitted tasks.
//!
//! A [`JobRecord`] follows `pending -> running -> done | failed`. Trackers are
//! best effort: a tracker failure is logged by the caller and never fails the
//! task itself.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use conveyor_core::{ErrorKind, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: TaskId,
    pub name: String,
    pub status: JobState,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(TaskId::new(), name)
    }

    pub fn with_id(task_id: TaskId, name: impl Into<String>) -> Self {
        Self {
            task_id,
            name: name.into(),
            status: JobState::Pending,
            attributes: Map::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn mark_running(&mut self) {
        self.status = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_done(&mut self, result: Value) {
        self.status = JobState::Done;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobState::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Whether every `(key, value)` in `filter` is present on this record.
    pub fn matches(&self, filter: &Map<String, Value>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.attributes.get(k) == Some(v))
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("job not found: {0}")]
    NotFound(TaskId),

    #[error("tracker storage error: {0}")]
    Storage(String),

    #[error("tracker serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::NotFound(_) => ErrorKind::NotFound,
            TrackerError::Storage(_) => ErrorKind::ConnectionFailure,
            TrackerError::Serialization(_) => ErrorKind::SerializationFailure,
        }
    }
}

#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn create_job(&self, record: JobRecord) -> Result<JobRecord, TrackerError>;

    async fn set_running(&self, task_id: TaskId) -> Result<(), TrackerError>;

    async fn set_done(&self, task_id: TaskId, result: Value) -> Result<(), TrackerError>;

    async fn set_failed(&self, task_id: TaskId, error: &str) -> Result<(), TrackerError>;

    async fn status(&self, task_id: TaskId) -> Result<Option<JobRecord>, TrackerError>;

    async fn exists(&self, task_id: TaskId) -> Result<bool, TrackerError> {
        Ok(self.status(task_id).await?.is_some())
    }

    /// All known jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, TrackerError>;

    /// Jobs whose attributes contain every `(key, value)` in `filter`.
    async fn find_jobs(&self, filter: &Map<String, Value>) -> Result<Vec<JobRecord>, TrackerError>;

    async fn forget(&self, task_id: TaskId) -> Result<(), TrackerError>;

    async fn flush(&self) -> Result<(), TrackerError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobTracker {
    jobs: RwLock<HashMap<TaskId, JobRecord>>,
}

impl InMemoryJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, task_id: TaskId, f: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut JobRecord) + Send,
    {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&task_id).ok_or(TrackerError::NotFound(task_id))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl JobTracker for InMemoryJobTracker {
    async fn create_job(&self, record: JobRecord) -> Result<JobRecord, TrackerError> {
        self.jobs.write().await.insert(record.task_id, record.clone());
        Ok(record)
    }

    async fn set_running(&self, task_id: TaskId) -> Result<(), TrackerError> {
        self.update(task_id, JobRecord::mark_running).await
    }

    async fn set_done(&self, task_id: TaskId, result: Value) -> Result<(), TrackerError> {
        self.update(task_id, |r| r.mark_done(result)).await
    }

    async fn set_failed(&self, task_id: TaskId, error: &str) -> Result<(), TrackerError> {
        let error = error.to_string();
        self.update(task_id, |r| r.mark_failed(error)).await
    }

    async fn status(&self, task_id: TaskId) -> Result<Option<JobRecord>, TrackerError> {
        Ok(self.jobs.read().await.get(&task_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, TrackerError> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|r| (r.created_at, r.task_id));
        Ok(jobs)
    }

    async fn find_jobs(&self, filter: &Map<String, Value>) -> Result<Vec<JobRecord>, TrackerError> {
        Ok(self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|r| r.matches(filter))
            .collect())
    }

    async fn forget(&self, task_id: TaskId) -> Result<(), TrackerError> {
        self.jobs.write().await.remove(&task_id);
        Ok(())
    }

    async fn flush(&self) -> Result<(), TrackerError> {
        self.jobs.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn lifecycle_transitions() {
        let tracker = InMemoryJobTracker::new();
        let record = tracker.create_job(JobRecord::new("report")).await.unwrap();
        let id = record.task_id;

        tracker.set_running(id).await.unwrap();
        let running = tracker.status(id).await.unwrap().unwrap();
        assert_eq!(running.status, JobState::Running);
        assert!(running.started_at.is_some());

        tracker.set_done(id, json!({"rows": 3})).await.unwrap();
        let done = tracker.status(id).await.unwrap().unwrap();
        assert_eq!(done.status, JobState::Done);
        assert_eq!(done.result, Some(json!({"rows": 3})));
        assert!(done.status.is_terminal());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let tracker = InMemoryJobTracker::new();
        let err = tracker.set_running(TaskId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!tracker.exists(TaskId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn find_by_attributes() {
        let tracker = InMemoryJobTracker::new();
        tracker
            .create_job(JobRecord::new("a").with_attribute("tenant", "acme"))
            .await
            .unwrap();
        tracker
            .create_job(JobRecord::new("b").with_attribute("tenant", "globex"))
            .await
            .unwrap();

        let mut filter = Map::new();
        filter.insert("tenant".into(), json!("acme"));
        let found = tracker.find_jobs(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");

        tracker.flush().await.unwrap();
        assert!(tracker.list_jobs().await.unwrap().is_empty());
    }

    #[test]
    fn record_serializes_snake_case_status() {
        let record = JobRecord::new("x");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "pending");
        let back: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
