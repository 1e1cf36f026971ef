//! In-memory broker for tests/dev.
//!
//! - No IO; topic routing with `*` / `#` wildcards
//! - Competing consumers: each delivery goes to one receiver
//! - Tracks acked, retried and dead-lettered deliveries for inspection
//! - `fail_next_publishes` injects transient publish failures

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::Notify;

use crate::connection::{BrokerConnection, ConnectionState};
use crate::consumer::{Delivery, MessageSource, SubscribeOptions};
use crate::envelope::Event;
use crate::error::BrokerError;

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    ready: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    published: Vec<Event>,
    acked: Vec<String>,
    dead_letters: Vec<Delivery>,
}

#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    connection: RwLock<ConnectionState>,
    arrivals: Notify,
    publish_attempts: AtomicU64,
    failures_left: AtomicU64,
    poll_interval: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, n: u64) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Publish calls made, failed ones included.
    pub fn publish_attempts(&self) -> u64 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Successfully published events, in order.
    pub fn published(&self) -> Vec<Event> {
        self.lock().published.clone()
    }

    /// Ids of acknowledged deliveries.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.lock().dead_letters.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn take_matching(&self, options: &SubscribeOptions) -> Vec<Delivery> {
        let limit = usize::from(options.prefetch_count.max(1));
        let mut state = self.lock();
        let mut batch = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.ready.len());

        while let Some(delivery) = state.ready.pop_front() {
            if batch.len() < limit
                && delivery.destination == options.destination
                && topic_matches(&options.routing_key, &delivery.routing_key)
            {
                batch.push(delivery);
            } else {
                remaining.push_back(delivery);
            }
        }
        state.ready = remaining;

        for delivery in &batch {
            state.in_flight.insert(delivery.id.clone(), delivery.clone());
        }
        batch
    }

    fn settle(&self, delivery: &Delivery) -> Result<Delivery, BrokerError> {
        self.lock()
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery {}", delivery.id)))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            connection: RwLock::new(ConnectionState::Disconnected),
            arrivals: Notify::new(),
            publish_attempts: AtomicU64::new(0),
            failures_left: AtomicU64::new(0),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn state(&self) -> ConnectionState {
        *self.connection.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    async fn publish_message(&self, event: &Event) -> Result<(), BrokerError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::publish("injected failure"));
        }
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        {
            let mut state = self.lock();
            state.next_id += 1;
            let delivery = Delivery {
                id: state.next_id.to_string(),
                destination: event.destination().to_string(),
                routing_key: event.routing_key().to_string(),
                content_type: Some(event.content_type().mime().to_string()),
                body: event.body().to_vec(),
                headers: event.headers().cloned().unwrap_or_else(Map::new),
                retry_count: 0,
            };
            state.ready.push_back(delivery);
            state.published.push(event.clone());
        }
        self.arrivals.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn subscribe(&self, _options: &SubscribeOptions) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    async fn receive(&self, options: &SubscribeOptions) -> Result<Vec<Delivery>, BrokerError> {
        let batch = self.take_matching(options);
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(self.poll_interval, self.arrivals.notified()).await;
        Ok(self.take_matching(options))
    }

    async fn ack(&self, _options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError> {
        let settled = self.settle(delivery)?;
        self.lock().acked.push(settled.id);
        Ok(())
    }

    async fn retry(&self, _options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut settled = self.settle(delivery)?;
        settled.retry_count += 1;
        self.lock().ready.push_back(settled);
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn reject(&self, _options: &SubscribeOptions, delivery: &Delivery) -> Result<(), BrokerError> {
        let settled = self.settle(delivery)?;
        self.lock().dead_letters.push(settled);
        Ok(())
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
/// An empty pattern matches everything.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    if pattern.is_empty() || pattern == "#" {
        return true;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => match_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}
