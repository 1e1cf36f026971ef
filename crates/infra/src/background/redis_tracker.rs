//! Redis-backed [`JobTracker`].
//!
//! ## Keys
//!
//! - `{prefix}{task_id}`: JSON record, expires after `ttl` (at most 30 days)
//! - `{prefix}__all`: set of every tracked task id
//! - `{prefix}attr:{key}:{value}`: set of task ids carrying that attribute
//!
//! Updates rewrite the record with `KEEPTTL`, so a job keeps its original
//! expiry while moving through its states. Ids whose record has expired are
//! pruned from the index sets the next time a lookup reads them.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use conveyor_core::TaskId;

use super::tracker::{JobRecord, JobTracker, TrackerError};

pub const DEFAULT_PREFIX: &str = "job:";
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct RedisJobTracker {
    client: redis::Client,
    prefix: String,
    ttl: Duration,
    conn: OnceCell<MultiplexedConnection>,
}

impl core::fmt::Debug for RedisJobTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisJobTracker")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn storage(e: redis::RedisError) -> TrackerError {
    TrackerError::Storage(e.to_string())
}

impl RedisJobTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let client = redis::Client::open(url).map_err(storage)?;
        Ok(Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            ttl: MAX_TTL,
            conn: OnceCell::new(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Record lifetime, capped at 30 days.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.min(MAX_TTL);
        self
    }

    fn job_key(&self, task_id: TaskId) -> String {
        format!("{}{}", self.prefix, task_id)
    }

    fn all_key(&self) -> String {
        format!("{}__all", self.prefix)
    }

    fn attr_key(&self, key: &str, value: &Value) -> String {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        format!("{}attr:{}:{}", self.prefix, key, value)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, TrackerError> {
        self.conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(storage)
            })
            .await
            .cloned()
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        task_id: TaskId,
    ) -> Result<Option<JobRecord>, TrackerError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(task_id))
            .query_async(conn)
            .await
            .map_err(storage)?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(TrackerError::from))
            .transpose()
    }

    async fn update<F>(&self, task_id: TaskId, f: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut JobRecord) + Send,
    {
        let mut conn = self.connection().await?;
        let mut record = self
            .load(&mut conn, task_id)
            .await?
            .ok_or(TrackerError::NotFound(task_id))?;
        f(&mut record);
        let _: () = redis::cmd("SET")
            .arg(self.job_key(task_id))
            .arg(serde_json::to_string(&record)?)
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    /// Load the records for `ids` read from the `index_keys` sets, pruning
    /// expired ids from those sets and from `__all`.
    async fn load_many(&self, ids: Vec<String>, index_keys: &[String]) -> Result<Vec<JobRecord>, TrackerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = ids.iter().map(|id| format!("{}{}", self.prefix, id)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys[..])
            .query_async(&mut conn)
            .await
            .map_err(storage)?;

        let (live, expired) = partition_expired(ids, raws);
        if !expired.is_empty() {
            let mut pipe = redis::pipe();
            pipe.cmd("SREM").arg(self.all_key()).arg(&expired[..]).ignore();
            for key in index_keys {
                pipe.cmd("SREM").arg(key).arg(&expired[..]).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await.map_err(storage)?;
            debug!(count = expired.len(), "pruned expired job ids from index");
        }

        let mut records = live
            .iter()
            .map(|raw| serde_json::from_str::<JobRecord>(raw))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| (r.created_at, r.task_id));
        Ok(records)
    }
}

#[async_trait]
impl JobTracker for RedisJobTracker {
    #[instrument(skip(self, record), fields(task_id = %record.task_id), err)]
    async fn create_job(&self, record: JobRecord) -> Result<JobRecord, TrackerError> {
        let mut conn = self.connection().await?;
        let id = record.task_id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.job_key(record.task_id))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .ignore()
            .cmd("SADD")
            .arg(self.all_key())
            .arg(&id)
            .ignore();
        for (key, value) in &record.attributes {
            pipe.cmd("SADD").arg(self.attr_key(key, value)).arg(&id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(storage)?;
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
        let mut conn = self.connection().await?;
        self.load(&mut conn, task_id).await
    }

    async fn exists(&self, task_id: TaskId) -> Result<bool, TrackerError> {
        let mut conn = self.connection().await?;
        redis::cmd("EXISTS")
            .arg(self.job_key(task_id))
            .query_async(&mut conn)
            .await
            .map_err(storage)
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, TrackerError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.all_key())
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        self.load_many(ids, &[]).await
    }

    async fn find_jobs(&self, filter: &Map<String, Value>) -> Result<Vec<JobRecord>, TrackerError> {
        if filter.is_empty() {
            return self.list_jobs().await;
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = filter.iter().map(|(k, v)| self.attr_key(k, v)).collect();
        let ids: Vec<String> = redis::cmd("SINTER")
            .arg(&keys[..])
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        self.load_many(ids, &keys).await
    }

    async fn forget(&self, task_id: TaskId) -> Result<(), TrackerError> {
        let mut conn = self.connection().await?;
        let record = self.load(&mut conn, task_id).await?;
        let id = task_id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(self.job_key(task_id))
            .ignore()
            .cmd("SREM")
            .arg(self.all_key())
            .arg(&id)
            .ignore();
        if let Some(record) = record {
            for (key, value) in &record.attributes {
                pipe.cmd("SREM").arg(self.attr_key(key, value)).arg(&id).ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(storage)?;
        Ok(())
    }

    /// Delete every key under the prefix.
    async fn flush(&self) -> Result<(), TrackerError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(storage)?;
            if !keys.is_empty() {
                let _: () = redis::cmd("DEL")
                    .arg(&keys[..])
                    .query_async(&mut conn)
                    .await
                    .map_err(storage)?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}

/// Split MGET results into live records and the ids whose record is gone.
fn partition_expired(ids: Vec<String>, raws: Vec<Option<String>>) -> (Vec<String>, Vec<String>) {
    let mut live = Vec::with_capacity(raws.len());
    let mut expired = Vec::new();
    for (id, raw) in ids.into_iter().zip(raws) {
        match raw {
            Some(raw) => live.push(raw),
            None => expired.push(id),
        }
    }
    (live, expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_layout() {
        let tracker = RedisJobTracker::new("redis://localhost:6379/0")
            .unwrap()
            .with_prefix("jobs:")
            .with_ttl(Duration::from_secs(90 * 24 * 60 * 60));
        let id = TaskId::new();

        assert_eq!(tracker.job_key(id), format!("jobs:{id}"));
        assert_eq!(tracker.all_key(), "jobs:__all");
        assert_eq!(tracker.attr_key("tenant", &json!("acme")), "jobs:attr:tenant:acme");
        assert_eq!(tracker.attr_key("n", &json!(3)), "jobs:attr:n:3");
        assert_eq!(tracker.ttl, MAX_TTL);
    }

    #[test]
    fn expired_ids_are_split_from_live_records() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let raws = vec![Some("{}".to_string()), None, Some("[]".to_string())];

        let (live, expired) = partition_expired(ids, raws);
        assert_eq!(live, vec!["{}".to_string(), "[]".to_string()]);
        assert_eq!(expired, vec!["b".to_string()]);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_BROKER_URL"]
    async fn tracks_a_job_through_redis() {
        let url = std::env::var("REDIS_BROKER_URL").unwrap_or_else(|_| "redis://localhost:6379/0".into());
        let tracker = RedisJobTracker::new(&url)
            .unwrap()
            .with_prefix(format!("conveyor-test-{}:", uuid::Uuid::now_v7()));

        let record = tracker
            .create_job(JobRecord::new("export").with_attribute("tenant", "acme"))
            .await
            .unwrap();
        tracker.set_running(record.task_id).await.unwrap();
        tracker.set_done(record.task_id, json!(1)).await.unwrap();

        let mut filter = Map::new();
        filter.insert("tenant".into(), json!("acme"));
        let found = tracker.find_jobs(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].result, Some(json!(1)));

        // An expired record is pruned from the index on the next lookup.
        let _: () = redis::cmd("DEL")
            .arg(tracker.job_key(record.task_id))
            .query_async(&mut tracker.connection().await.unwrap())
            .await
            .unwrap();
        assert!(tracker.find_jobs(&filter).await.unwrap().is_empty());
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(tracker.attr_key("tenant", &json!("acme")))
            .query_async(&mut tracker.connection().await.unwrap())
            .await
            .unwrap();
        assert!(members.is_empty());

        tracker.flush().await.unwrap();
        assert!(!tracker.exists(record.task_id).await.unwrap());
    }
}
