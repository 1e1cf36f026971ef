//! Redis Streams broker backend (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: the event destination
//! - **Entry fields**: `body` (encoded bytes), `ContentType` (mime tag),
//!   `routing_key`, `event_id`, plus one string field per event attribute;
//!   attributes named like one of those fields are dropped
//! - **Consumer group**: `REDIS_BROKER_GROUP` unless the subscription names a
//!   queue; created idempotently together with the consumer
//! - **Redelivery**: before reading new entries a consumer reclaims its own
//!   entries that stayed pending longer than `claim_idle` (XPENDING + XCLAIM)
//! - **Dead letters**: `{stream}:dlq` with `original_message_id`,
//!   `retry_count` and `failed_at`
//! - **Retention**: housekeeping trims entries older than the retention window
//!
//! Routing keys are carried but not filtered on; a stream has no bindings.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use conveyor_core::config::{env_or, env_secs, env_var};
use conveyor_events::{
    BrokerConnection, BrokerError, ConnectionSlot, ConnectionState, Delivery, Event, MessageSource,
    ReconnectPolicy, SubscribeOptions,
};

pub const BODY_FIELD: &str = "body";
pub const CONTENT_TYPE_FIELD: &str = "ContentType";
const ROUTING_KEY_FIELD: &str = "routing_key";
const EVENT_ID_FIELD: &str = "event_id";
const RESERVED_FIELDS: [&str; 4] = [BODY_FIELD, CONTENT_TYPE_FIELD, ROUTING_KEY_FIELD, EVENT_ID_FIELD];

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub group: String,
    pub consumer: String,
    /// Entries older than this are trimmed by housekeeping.
    pub retention: Duration,
    pub housekeeping_interval: Duration,
    /// How long XREADGROUP blocks waiting for new entries.
    pub block: Duration,
    /// Pending entries idle at least this long are reclaimed and redelivered.
    pub claim_idle: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            group: "default_group".to_string(),
            consumer: "default_consumer".to_string(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            housekeeping_interval: Duration::from_secs(60 * 60),
            block: Duration::from_secs(1),
            claim_idle: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RedisConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let url = env_var("REDIS_BROKER_URL").unwrap_or_else(|| {
            redis_url(
                &env_or("REDIS_BROKER_HOST", "localhost".to_string()),
                env_or("REDIS_BROKER_PORT", 6379u16),
                env_or("REDIS_BROKER_DB", 0u32),
                env_var("REDIS_BROKER_PASSWORD").as_deref(),
            )
        });
        let retention_days = env_or("STREAM_RETENTION_DAYS", 7u64);

        Self {
            url,
            group: env_var("REDIS_BROKER_GROUP").unwrap_or(d.group),
            consumer: env_var("REDIS_BROKER_CONSUMER").unwrap_or(d.consumer),
            retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            housekeeping_interval: env_secs("STREAM_TRIM_INTERVAL_SECS", d.housekeeping_interval),
            block: d.block,
            claim_idle: env_secs("STREAM_CLAIM_IDLE_SECS", d.claim_idle),
            reconnect: ReconnectPolicy::from_env(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }
}

/// Commands and blocking reads use separate connections so a pending
/// XREADGROUP never delays a publish.
#[derive(Clone)]
struct RedisHandles {
    commands: MultiplexedConnection,
    reader: MultiplexedConnection,
}

pub struct RedisStreamsBroker {
    client: redis::Client,
    config: RedisConfig,
    slot: ConnectionSlot<RedisHandles>,
}

impl core::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("group", &self.config.group)
            .field("consumer", &self.config.consumer)
            .field("state", &self.slot.state())
            .finish()
    }
}

impl RedisStreamsBroker {
    pub fn new(config: RedisConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Connection(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            slot: ConnectionSlot::new("redis", config.reconnect.clone()),
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn group_for(&self, options: &SubscribeOptions) -> String {
        options
            .queue_name
            .clone()
            .unwrap_or_else(|| self.config.group.clone())
    }

    fn dlq_key(stream: &str) -> String {
        format!("{stream}:dlq")
    }

    async fn handles(&self) -> Result<RedisHandles, BrokerError> {
        self.ensure_connection().await?;
        self.slot.handle().ok_or(BrokerError::NotConnected)
    }

    /// Map a redis error, dropping the handle when the link itself failed.
    fn classify(&self, op: &str, e: redis::RedisError, wrap: fn(String) -> BrokerError) -> BrokerError {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            self.slot.invalidate();
            return BrokerError::Connection(format!("{op}: {e}"));
        }
        wrap(format!("{op}: {e}"))
    }

    async fn read_pending(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let idle_ms = self.config.claim_idle.as_millis() as u64;
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(&self.config.consumer)
            .query_async(conn)
            .await
            .map_err(|e| self.classify("XPENDING", e, BrokerError::Connection))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.iter().map(|(id, ..)| id.as_str()).collect();
        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(&self.config.consumer)
            .arg(idle_ms)
            .arg(&ids[..])
            .query_async(conn)
            .await
            .map_err(|e| self.classify("XCLAIM", e, BrokerError::Connection))?;

        let mut deliveries = Vec::new();
        for entry in bulk(claimed) {
            match parse_entry(stream, entry) {
                Ok(Some(mut delivery)) => {
                    delivery.retry_count = pending
                        .iter()
                        .find(|(id, ..)| *id == delivery.id)
                        .map(|(.., times)| u32::try_from(*times).unwrap_or(u32::MAX))
                        .unwrap_or(1);
                    deliveries.push(delivery);
                }
                Ok(None) => {}
                Err(e) => warn!(stream, error = %e, "skipping malformed stream entry"),
            }
        }
        Ok(deliveries)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.config.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| self.classify("XREADGROUP", e, BrokerError::Connection))?;

        // [[stream, [entry, ...]], ...] or nil when the block timed out.
        let mut deliveries = Vec::new();
        for stream_reply in bulk(reply) {
            let mut parts = bulk(stream_reply).into_iter();
            let (Some(_key), Some(entries)) = (parts.next(), parts.next()) else {
                continue;
            };
            for entry in bulk(entries) {
                match parse_entry(stream, entry) {
                    Ok(Some(delivery)) => deliveries.push(delivery),
                    Ok(None) => {}
                    Err(e) => warn!(stream, error = %e, "skipping malformed stream entry"),
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl BrokerConnection for RedisStreamsBroker {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    #[instrument(skip(self), fields(consumer = %self.config.consumer), err)]
    async fn connect(&self) -> Result<(), BrokerError> {
        self.slot
            .connect(|| {
                let client = self.client.clone();
                async move {
                    let mut commands = client.get_multiplexed_async_connection().await?;
                    let reader = client.get_multiplexed_async_connection().await?;
                    let _: String = redis::cmd("PING").query_async(&mut commands).await?;
                    Ok::<_, redis::RedisError>(RedisHandles { commands, reader })
                }
            })
            .await
            .map(|_| ())
    }

    async fn disconnect(&self) {
        // Multiplexed connections close when the last clone is dropped.
        self.slot
            .disconnect(|handles| async move {
                drop(handles);
                Ok::<(), redis::RedisError>(())
            })
            .await;
    }

    #[instrument(
        skip(self, event),
        fields(stream = %event.destination(), routing_key = %event.routing_key()),
        err
    )]
    async fn publish_message(&self, event: &Event) -> Result<(), BrokerError> {
        let mut conn = self.handles().await?.commands;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(event.destination())
            .arg("*")
            .arg(BODY_FIELD)
            .arg(event.body())
            .arg(CONTENT_TYPE_FIELD)
            .arg(event.content_type().mime())
            .arg(ROUTING_KEY_FIELD)
            .arg(event.routing_key())
            .arg(EVENT_ID_FIELD)
            .arg(event.event_id().to_string());
        for (key, value) in attribute_fields(event.attributes()) {
            cmd.arg(key).arg(value);
        }

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify("XADD", e, BrokerError::Publish))?;
        debug!(message_id = %id, "event appended to stream");
        Ok(())
    }
}

#[async_trait]
impl MessageSource for RedisStreamsBroker {
    #[instrument(skip(self, options), fields(stream = %options.destination), err)]
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<(), BrokerError> {
        let mut conn = self.handles().await?.commands;
        let group = self.group_for(options);

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&options.destination)
            .arg(&group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => info!(stream = %options.destination, group = %group, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %options.destination, group = %group, "consumer group exists")
            }
            Err(e) => return Err(self.classify("XGROUP CREATE", e, BrokerError::Connection)),
        }

        let consumer: redis::RedisResult<i64> = redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(&options.destination)
            .arg(&group)
            .arg(&self.config.consumer)
            .query_async(&mut conn)
            .await;
        if let Err(e) = consumer {
            // Older servers create consumers implicitly on first read.
            debug!(error = %e, "XGROUP CREATECONSUMER not applied");
        }
        Ok(())
    }

    async fn receive(&self, options: &SubscribeOptions) -> Result<Vec<Delivery>, BrokerError> {
        let handles = self.handles().await?;
        let group = self.group_for(options);
        let count = usize::from(options.prefetch_count.max(1));

        let mut commands = handles.commands;
        let pending = self
            .read_pending(&mut commands, &options.destination, &group, count)
            .await?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        let mut reader = handles.reader;
        self.read_new(&mut reader, &options.destination, &group, count)
            .await
    }

    async fn ack(&self, options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.handles().await?.commands;
        let _: u64 = redis::cmd("XACK")
            .arg(&delivery.destination)
            .arg(self.group_for(options))
            .arg(&delivery.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify("XACK", e, BrokerError::Ack))?;
        Ok(())
    }

    /// The entry stays pending and is reclaimed once idle for `claim_idle`.
    async fn retry(&self, _options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError> {
        debug!(
            message_id = %delivery.id,
            retry_count = delivery.retry_count,
            "leaving message pending for redelivery"
        );
        Ok(())
    }

    async fn reject(&self, options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.handles().await?.commands;
        let dlq = Self::dlq_key(&delivery.destination);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&dlq)
            .arg("*")
            .arg("original_message_id")
            .arg(&delivery.id)
            .arg("retry_count")
            .arg(delivery.retry_count)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg(ROUTING_KEY_FIELD)
            .arg(&delivery.routing_key)
            .arg(BODY_FIELD)
            .arg(&delivery.body[..]);
        if let Some(content_type) = &delivery.content_type {
            cmd.arg(CONTENT_TYPE_FIELD).arg(content_type);
        }
        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify("DLQ XADD", e, BrokerError::Ack))?;

        self.ack(options, delivery).await?;
        warn!(
            message_id = %delivery.id,
            retry_count = delivery.retry_count,
            dlq = %dlq,
            "message sent to dead-letter stream"
        );
        Ok(())
    }

    /// Trim entries older than the retention window.
    async fn housekeeping(&self, options: &SubscribeOptions) -> Result<(), BrokerError> {
        let mut conn = self.handles().await?.commands;
        let cutoff = trim_cutoff_ms(Utc::now().timestamp_millis(), self.config.retention);
        let trimmed: u64 = redis::cmd("XTRIM")
            .arg(&options.destination)
            .arg("MINID")
            .arg(cutoff)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify("XTRIM", e, BrokerError::Connection))?;
        if trimmed > 0 {
            info!(stream = %options.destination, trimmed, "trimmed expired stream entries");
        }
        Ok(())
    }

    fn housekeeping_interval(&self) -> Option<Duration> {
        Some(self.config.housekeeping_interval)
    }
}

/// Stream ids start with a millisecond timestamp, so MINID at the cutoff
/// drops everything older.
fn trim_cutoff_ms(now_ms: i64, retention: Duration) -> i64 {
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(retention_ms).max(0)
}

fn redis_url(host: &str, port: u16, db: u32, password: Option<&str>) -> String {
    match password {
        Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
        None => format!("redis://{host}:{port}/{db}"),
    }
}

/// Attribute fields for XADD, minus any that would shadow an entry field.
fn attribute_fields(attributes: &Map<String, Value>) -> Vec<(&str, String)> {
    attributes
        .iter()
        .filter(|(key, _)| {
            let reserved = RESERVED_FIELDS.contains(&key.as_str());
            if reserved {
                warn!(attribute = %key, "attribute collides with a reserved stream field, dropped");
            }
            !reserved
        })
        .map(|(key, value)| (key.as_str(), field_value(value)))
        .collect()
}

fn field_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bulk(value: redis::Value) -> Vec<redis::Value> {
    match value {
        redis::Value::Bulk(items) => items,
        _ => Vec::new(),
    }
}

fn text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[id, [field, value, ...]]`. Entries deleted while pending come back
/// as `[id, nil]` and yield `None`.
fn parse_entry(stream: &str, entry: redis::Value) -> Result<Option<Delivery>, BrokerError> {
    let mut parts = bulk(entry).into_iter();
    let id = parts
        .next()
        .as_ref()
        .and_then(text)
        .ok_or_else(|| BrokerError::Serialization("stream entry without id".into()))?;
    let fields = match parts.next() {
        Some(redis::Value::Bulk(fields)) => fields,
        _ => return Ok(None),
    };

    let mut delivery = Delivery {
        id,
        destination: stream.to_string(),
        routing_key: String::new(),
        content_type: None,
        body: Vec::new(),
        headers: Map::new(),
        retry_count: 0,
    };

    for pair in fields.chunks(2) {
        let [key, value] = pair else { continue };
        let Some(key) = text(key) else { continue };
        match key.as_str() {
            BODY_FIELD => {
                if let redis::Value::Data(bytes) = value {
                    delivery.body = bytes.clone();
                }
            }
            CONTENT_TYPE_FIELD => delivery.content_type = text(value),
            ROUTING_KEY_FIELD => delivery.routing_key = text(value).unwrap_or_default(),
            _ => {
                let Some(raw) = text(value) else { continue };
                if key == "headers" {
                    if let Ok(Value::Object(headers)) = serde_json::from_str(&raw) {
                        delivery.headers.extend(headers);
                        continue;
                    }
                }
                delivery.headers.insert(key, Value::String(raw));
            }
        }
    }
    Ok(Some(delivery))
}
