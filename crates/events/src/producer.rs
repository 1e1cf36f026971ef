//! Queued event publisher with retry and exponential backoff.
//!
//! ## Flow
//!
//! - `queue_event` validates and enqueues without waiting; a saturated queue
//!   fails fast with [`BrokerError::QueueFull`]
//! - `num_workers` publisher tasks drain the queue, each publishing with
//!   doubling backoff until the event's `max_retries` budget is spent
//! - Exhausted or permanently failing events go to the [`DeadLetterSink`]
//! - Every dequeued event is marked done exactly once, including when a
//!   worker is cancelled mid-backoff
//!
//! Ordering is FIFO per worker; there is no global ordering across workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_core::WorkQueue;
use conveyor_core::config::{env_millis, env_or, env_secs};

use crate::connection::BrokerConnection;
use crate::envelope::Event;
use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Event queue capacity.
    pub queue_size: usize,
    pub num_workers: usize,
    /// Backoff after the first failed attempt; doubles on every retry.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Pause after each successful enqueue so workers get scheduled.
    pub put_delay: Duration,
    /// Upper bound for draining the queue on `stop`.
    pub stop_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            num_workers: 4,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            put_delay: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl ProducerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_size: env_or("BROKER_MANAGER_QUEUE_SIZE", d.queue_size),
            num_workers: env_or("BROKER_NUM_WORKERS", d.num_workers),
            retry_delay: env_millis("BROKER_RETRY_DELAY_MS", d.retry_delay),
            max_retry_delay: d.max_retry_delay,
            put_delay: env_millis("BROKER_PUT_DELAY_MS", d.put_delay),
            stop_timeout: env_secs("BROKER_STOP_TIMEOUT_SECS", d.stop_timeout),
        }
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Destination for events the producer gave up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn on_exhausted(&self, event: &Event, error: &BrokerError);
}

/// Default sink: log and drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterSink for LogDeadLetters {
    async fn on_exhausted(&self, event: &Event, error: &BrokerError) {
        error!(
            event_id = %event.event_id(),
            event = %event.qualified_name(),
            max_retries = event.max_retries(),
            error = %error,
            "dropping event after failed publish"
        );
    }
}

/// Producer counters.
#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    published: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub queued: u64,
    pub published: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub pending: usize,
}

pub struct BrokerProducer {
    broker: Arc<dyn BrokerConnection>,
    queue: Arc<WorkQueue<Event>>,
    config: ProducerConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerProducer {
    pub fn new(broker: Arc<dyn BrokerConnection>, config: ProducerConfig) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new(config.queue_size)),
            broker,
            config,
            dead_letters: Arc::new(LogDeadLetters),
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn backend(&self) -> &'static str {
        self.broker.backend()
    }

    pub fn broker(&self) -> &Arc<dyn BrokerConnection> {
        &self.broker
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.lock_workers().is_empty()
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            pending: self.queue.unfinished(),
        }
    }

    /// Enqueue an event for background publishing.
    ///
    /// Fails immediately with `QueueFull` when the queue is saturated.
    pub async fn queue_event(&self, event: Event) -> Result<(), BrokerError> {
        let event_id = event.event_id();
        let name = event.qualified_name();

        self.queue.try_put(event).map_err(|e| {
            warn!(event = %name, error = %e, "event queue rejected event");
            BrokerError::from(e)
        })?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event_id, event = %name, pending = self.queue.len(), "event queued");

        if !self.config.put_delay.is_zero() {
            tokio::time::sleep(self.config.put_delay).await;
        }
        Ok(())
    }

    /// Publish immediately, bypassing the queue and the retry loop.
    pub async fn publish_event(&self, event: &Event) -> Result<(), BrokerError> {
        self.broker.ensure_connection().await?;
        self.broker.publish_message(event).await?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Connect to the broker and launch the publisher workers.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self.is_running() {
            return Ok(());
        }
        self.broker.connect().await?;

        let count = self.config.num_workers.max(1);
        let mut workers = self.lock_workers();
        for worker_id in 0..count {
            let ctx = WorkerContext {
                worker_id,
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                dead_letters: self.dead_letters.clone(),
                counters: self.counters.clone(),
                retry_delay: self.config.retry_delay,
                max_retry_delay: self.config.max_retry_delay,
            };
            workers.push(tokio::spawn(publisher_worker(ctx)));
        }

        info!(backend = self.backend(), workers = count, "broker producer started");
        Ok(())
    }

    /// Drain the queue (bounded by `stop_timeout`), cancel the workers and
    /// close the broker connection.
    pub async fn stop(&self) {
        self.queue.close();

        if self.is_running()
            && tokio::time::timeout(self.config.stop_timeout, self.queue.join())
                .await
                .is_err()
        {
            warn!(
                backend = self.backend(),
                pending = self.queue.unfinished(),
                timeout = ?self.config.stop_timeout,
                "event queue did not drain in time, forcing shutdown"
            );
        }

        let workers: Vec<_> = self.lock_workers().drain(..).collect();
        for handle in &workers {
            handle.abort();
        }
        for handle in workers {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "publisher worker terminated abnormally");
                }
            }
        }

        self.broker.disconnect().await;
        info!(backend = self.backend(), "broker producer stopped");
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WorkerContext {
    worker_id: usize,
    broker: Arc<dyn BrokerConnection>,
    queue: Arc<WorkQueue<Event>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    counters: Arc<Counters>,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

/// Marks a dequeued event done when dropped, so cancellation mid-backoff
/// still balances the queue's unfinished count.
struct DoneGuard<'a>(&'a WorkQueue<Event>);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.task_done();
    }
}

async fn publisher_worker(ctx: WorkerContext) {
    debug!(worker = ctx.worker_id, "publisher worker started");

    while let Some(event) = ctx.queue.get().await {
        let _done = DoneGuard(&ctx.queue);

        match publish_with_retry(&ctx, &event).await {
            Ok(attempts) => {
                ctx.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker = ctx.worker_id,
                    event_id = %event.event_id(),
                    event = %event.qualified_name(),
                    attempts,
                    "event published"
                );
            }
            Err(e) => {
                ctx.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                ctx.dead_letters.on_exhausted(&event, &e).await;
            }
        }
    }
}

/// Publish with doubling backoff. Returns the number of attempts made.
async fn publish_with_retry(ctx: &WorkerContext, event: &Event) -> Result<u32, BrokerError> {
    let max_attempts = event.max_retries().max(1);
    let mut delay = ctx.retry_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match ctx.broker.ensure_connection().await {
            Ok(()) => ctx.broker.publish_message(event).await,
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(()) => return Ok(attempt),
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(
                worker = ctx.worker_id,
                event_id = %event.event_id(),
                error = %err,
                "permanent publish failure, not retrying"
            );
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(
                worker = ctx.worker_id,
                event_id = %event.event_id(),
                attempts = attempt,
                error = %err,
                "publish retries exhausted"
            );
            return Err(err);
        }

        warn!(
            worker = ctx.worker_id,
            event_id = %event.event_id(),
            attempt,
            retry_in = ?delay,
            error = %err,
            "publish failed, retrying"
        );
        ctx.counters.retries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2).min(ctx.max_retry_delay);
    }
}
