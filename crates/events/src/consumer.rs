//! Broker subscription loop.
//!
//! The backend-specific parts (declare/bind, receive, ack, requeue) sit behind
//! [`MessageSource`]; [`BrokerConsumer`] owns the uniform contract:
//!
//! receive -> decode by content type -> user handler -> ack on success.
//!
//! On handler failure the delivery is **not** acknowledged. With
//! `requeue_on_fail` and retry budget left it is handed back to the backend
//! for another attempt, otherwise it is rejected (dead-lettered).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use conveyor_core::{Payload, Serializer};

use crate::connection::BrokerConnection;
use crate::error::BrokerError;

/// Pause before polling again after a receive error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeType {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeType::Topic => "topic",
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }
}

impl core::str::FromStr for ExchangeType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "topic" => Ok(Self::Topic),
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "headers" => Ok(Self::Headers),
            other => Err(BrokerError::Validation(format!("unknown exchange type: {other}"))),
        }
    }
}

/// What to consume and how to treat failures.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Exchange (RabbitMQ) or stream (Redis).
    pub destination: String,
    /// Binding pattern; `#` / `*` wildcards follow topic-exchange rules.
    pub routing_key: String,
    /// Explicit queue name; backends derive one when absent.
    pub queue_name: Option<String>,
    pub exchange_type: ExchangeType,
    pub durable: bool,
    pub prefetch_count: u16,
    pub requeue_on_fail: bool,
    pub max_retries: u32,
}

impl SubscribeOptions {
    pub fn new(destination: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            routing_key: routing_key.into(),
            queue_name: None,
            exchange_type: ExchangeType::Topic,
            durable: true,
            prefetch_count: 1,
            requeue_on_fail: true,
            max_retries: 3,
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    pub fn with_exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = exchange_type;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch;
        self
    }

    pub fn with_requeue_on_fail(mut self, requeue: bool) -> Self {
        self.requeue_on_fail = requeue;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Queue name, defaulting to `{destination}.{routing_key}`.
    pub fn resolved_queue_name(&self) -> String {
        match &self.queue_name {
            Some(name) => name.clone(),
            None if self.routing_key.is_empty() => self.destination.clone(),
            None => format!("{}.{}", self.destination, self.routing_key),
        }
    }
}

/// A raw message as delivered by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Delivery tag (RabbitMQ) or entry id (Redis).
    pub id: String,
    pub destination: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub headers: Map<String, Value>,
    /// Previous failed attempts for this message.
    pub retry_count: u32,
}

/// A decoded message handed to user code.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub destination: String,
    pub routing_key: String,
    pub payload: Payload,
    pub headers: Map<String, Value>,
    pub retry_count: u32,
}

/// User callback; both plain and async functions are supported.
#[derive(Clone)]
pub enum MessageHandler {
    Sync(Arc<dyn Fn(Message) -> anyhow::Result<()> + Send + Sync>),
    Async(Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>),
}

impl MessageHandler {
    /// Wrap a plain function. It runs inline on the consumer task and
    /// should not block.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |msg| f(msg).boxed()))
    }

    /// Invoke the handler; a panic is reported as an error.
    pub async fn call(&self, message: Message) -> anyhow::Result<()> {
        let outcome = match self {
            MessageHandler::Sync(f) => {
                let f = f.clone();
                AssertUnwindSafe(async move { f(message) }).catch_unwind().await
            }
            MessageHandler::Async(f) => AssertUnwindSafe(f(message)).catch_unwind().await,
        };
        outcome.unwrap_or_else(|_| Err(anyhow::anyhow!("message handler panicked")))
    }
}

impl core::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MessageHandler::Sync(_) => f.write_str("MessageHandler::Sync"),
            MessageHandler::Async(_) => f.write_str("MessageHandler::Async"),
        }
    }
}

/// Backend half of a subscription.
#[async_trait]
pub trait MessageSource: BrokerConnection {
    /// Declare and bind the destination (exchange + queue, or stream + group)
    /// and apply QoS. Must be idempotent.
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<(), BrokerError>;

    /// Wait briefly for the next batch; an empty batch means "nothing yet".
    async fn receive(&self, options: &SubscribeOptions) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Make a failed delivery eligible for another attempt.
    async fn retry(&self, options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Give up on a failed delivery.
    async fn reject(&self, options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Periodic maintenance such as stream trimming.
    async fn housekeeping(&self, _options: &SubscribeOptions) -> Result<(), BrokerError> {
        Ok(())
    }

    /// How often `housekeeping` runs; `None` disables it.
    fn housekeeping_interval(&self) -> Option<Duration> {
        None
    }
}

/// Runs one consumption task per subscription.
pub struct BrokerConsumer {
    source: Arc<dyn MessageSource>,
    tasks: Mutex<Vec<(String, ConsumeTask)>>,
}

type ConsumeTask = JoinHandle<Result<(), BrokerError>>;

impl BrokerConsumer {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.source.backend()
    }

    /// Names of the active subscriptions. A subscription whose loop gave up
    /// (reconnect budget exhausted) is no longer listed.
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock_tasks()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Connect, declare, and start consuming in the background.
    pub async fn subscribe_to_events(
        &self,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<(), BrokerError> {
        self.source.ensure_connection().await?;
        self.source.subscribe(&options).await?;

        let name = options.resolved_queue_name();
        info!(
            backend = self.backend(),
            destination = %options.destination,
            routing_key = %options.routing_key,
            queue = %name,
            "subscribed to events"
        );

        let handle = tokio::spawn(consume_loop(self.source.clone(), options, handler));
        self.lock_tasks().push((name, handle));
        Ok(())
    }

    /// Decode a raw delivery by its content type.
    pub fn process_message(delivery: &Delivery) -> Result<Message, BrokerError> {
        let payload = Serializer.decode(&delivery.body, delivery.content_type.as_deref())?;
        Ok(Message {
            id: delivery.id.clone(),
            destination: delivery.destination.clone(),
            routing_key: delivery.routing_key.clone(),
            payload,
            headers: delivery.headers.clone(),
            retry_count: delivery.retry_count,
        })
    }

    /// Cancel every consumption task and wait for it to finish.
    pub async fn stop_consumer(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for (_, handle) in &tasks {
            handle.abort();
        }
        for (name, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(queue = %name, error = %e, "consumer had already stopped"),
                Err(e) if e.is_cancelled() => debug!(queue = %name, "consumer cancelled"),
                Err(e) => error!(queue = %name, error = %e, "consumer task failed"),
            }
        }
        info!(backend = self.backend(), "broker consumer stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<(String, ConsumeTask)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs until cancelled, or until the connection is lost and
/// `ensure_connection` has spent its reconnect attempts.
async fn consume_loop(
    source: Arc<dyn MessageSource>,
    options: SubscribeOptions,
    handler: MessageHandler,
) -> Result<(), BrokerError> {
    let interval = source.housekeeping_interval();
    let mut next_housekeeping = Instant::now();

    loop {
        if let Some(every) = interval {
            if Instant::now() >= next_housekeeping {
                if let Err(e) = source.housekeeping(&options).await {
                    warn!(destination = %options.destination, error = %e, "housekeeping failed");
                }
                next_housekeeping = Instant::now() + every;
            }
        }

        let batch = match source.receive(&options).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(destination = %options.destination, error = %e, "receive failed");
                if !source.is_connected() {
                    if let Err(e) = source.ensure_connection().await {
                        error!(
                            destination = %options.destination,
                            error = %e,
                            "consumer cannot reconnect, ending subscription"
                        );
                        return Err(e);
                    }
                    if let Err(e) = source.subscribe(&options).await {
                        error!(
                            destination = %options.destination,
                            error = %e,
                            "resubscribe failed, ending subscription"
                        );
                        return Err(e);
                    }
                }
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };

        for delivery in batch {
            handle_delivery(source.as_ref(), &options, &handler, delivery).await;
        }
    }
}

async fn handle_delivery(
    source: &dyn MessageSource,
    options: &SubscribeOptions,
    handler: &MessageHandler,
    delivery: Delivery,
) {
    let message = match BrokerConsumer::process_message(&delivery) {
        Ok(message) => message,
        Err(e) => {
            // Redelivering an undecodable body cannot help.
            error!(message_id = %delivery.id, error = %e, "undecodable message, rejecting");
            if let Err(e) = source.reject(options, &delivery).await {
                warn!(message_id = %delivery.id, error = %e, "reject failed");
            }
            return;
        }
    };

    match handler.call(message).await {
        Ok(()) => {
            if let Err(e) = source.ack(options, &delivery).await {
                warn!(
                    message_id = %delivery.id,
                    error = %e,
                    "ack failed; message will be redelivered"
                );
            } else {
                debug!(message_id = %delivery.id, "message acknowledged");
            }
        }
        Err(e) => {
            warn!(
                message_id = %delivery.id,
                destination = %delivery.destination,
                retry_count = delivery.retry_count,
                error = %e,
                "message handler failed"
            );
            let result = if options.requeue_on_fail && delivery.retry_count < options.max_retries {
                source.retry(options, &delivery).await
            } else {
                source.reject(options, &delivery).await
            };
            if let Err(e) = result {
                warn!(message_id = %delivery.id, error = %e, "failed to settle message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Event;
    use crate::in_memory_bus::InMemoryBroker;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn json_message_is_decoded_and_acked_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = BrokerConsumer::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        consumer
            .subscribe_to_events(
                SubscribeOptions::new("navigator", "orders.*"),
                MessageHandler::sync(move |msg| {
                    tx.send(msg.payload)?;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let event = Event::new("navigator", "orders.created", &Payload::from(json!({"x": 1}))).unwrap();
        broker.publish_message(&event).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Payload::Json(json!({"x": 1})));

        eventually(|| broker.acked().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.acked().len(), 1);

        consumer.stop_consumer().await;
        assert!(consumer.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_is_retried_then_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = BrokerConsumer::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        consumer
            .subscribe_to_events(
                SubscribeOptions::new("navigator", "jobs").with_max_retries(2),
                MessageHandler::from_async(move |msg: Message| {
                    let tx = tx.clone();
                    async move {
                        tx.send(msg.retry_count)?;
                        Err::<(), _>(anyhow::anyhow!("boom"))
                    }
                }),
            )
            .await
            .unwrap();

        let event = Event::new("navigator", "jobs", &Payload::from("work")).unwrap();
        broker.publish_message(&event).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let n = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            seen.push(n);
        }
        assert_eq!(seen, vec![0, 1, 2]);

        eventually(|| broker.dead_letters().len() == 1).await;
        assert!(broker.acked().is_empty());
        consumer.stop_consumer().await;
    }

    #[tokio::test]
    async fn no_requeue_rejects_on_first_failure() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = BrokerConsumer::new(broker.clone());

        consumer
            .subscribe_to_events(
                SubscribeOptions::new("navigator", "jobs").with_requeue_on_fail(false),
                MessageHandler::sync(|_| anyhow::bail!("nope")),
            )
            .await
            .unwrap();

        let event = Event::new("navigator", "jobs", &Payload::from("x")).unwrap();
        broker.publish_message(&event).await.unwrap();

        eventually(|| broker.dead_letters().len() == 1).await;
        consumer.stop_consumer().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_consumer() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = BrokerConsumer::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        consumer
            .subscribe_to_events(
                SubscribeOptions::new("navigator", "jobs").with_requeue_on_fail(false),
                MessageHandler::sync(move |msg| {
                    if msg.payload == Payload::from("explode") {
                        panic!("handler exploded");
                    }
                    tx.send(())?;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        for body in ["explode", "fine"] {
            let event = Event::new("navigator", "jobs", &Payload::from(body)).unwrap();
            broker.publish_message(&event).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        eventually(|| broker.acked().len() == 1 && broker.dead_letters().len() == 1).await;
        consumer.stop_consumer().await;
    }

    /// Connects once; every receive drops the link and reconnects are refused.
    #[derive(Default)]
    struct FlakySource {
        connected: std::sync::atomic::AtomicBool,
        connects: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl BrokerConnection for FlakySource {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        fn state(&self) -> crate::connection::ConnectionState {
            use crate::connection::ConnectionState;
            if self.connected.load(Ordering::SeqCst) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }

        async fn connect(&self) -> Result<(), BrokerError> {
            if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(BrokerError::Connection("refused after 3 attempts".into()))
            }
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn publish_message(&self, _event: &Event) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl MessageSource for FlakySource {
        async fn subscribe(&self, _options: &SubscribeOptions) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn receive(&self, _options: &SubscribeOptions) -> Result<Vec<Delivery>, BrokerError> {
            self.connected.store(false, Ordering::SeqCst);
            Err(BrokerError::Connection("connection reset".into()))
        }

        async fn ack(&self, _: &SubscribeOptions, _: &Delivery) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn retry(&self, _: &SubscribeOptions, _: &Delivery) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn reject(&self, _: &SubscribeOptions, _: &Delivery) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_ends_when_reconnect_is_exhausted() {
        let source = Arc::new(FlakySource::default());
        let consumer = BrokerConsumer::new(source.clone());

        consumer
            .subscribe_to_events(
                SubscribeOptions::new("d", "k"),
                MessageHandler::sync(|_| Ok(())),
            )
            .await
            .unwrap();

        eventually(|| consumer.subscriptions().is_empty()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        // Initial connect plus one failed reconnect; no further attempts.
        assert_eq!(source.connects.load(Ordering::SeqCst), 2);
        consumer.stop_consumer().await;
    }

    #[test]
    fn unknown_content_type_yields_raw_body() {
        let delivery = Delivery {
            id: "1".into(),
            destination: "d".into(),
            routing_key: "r".into(),
            content_type: Some("application/x-custom".into()),
            body: b"raw".to_vec(),
            headers: Map::new(),
            retry_count: 0,
        };
        let message = BrokerConsumer::process_message(&delivery).unwrap();
        assert_eq!(message.payload, Payload::Bytes(b"raw".to_vec()));
    }

    #[test]
    fn queue_name_defaults_to_destination_and_key() {
        assert_eq!(SubscribeOptions::new("ex", "a.b").resolved_queue_name(), "ex.a.b");
        assert_eq!(SubscribeOptions::new("stream", "").resolved_queue_name(), "stream");
        assert_eq!(
            SubscribeOptions::new("ex", "a").with_queue_name("q").resolved_queue_name(),
            "q"
        );
    }
}
