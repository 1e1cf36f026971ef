//! Broker connection lifecycle (mechanics only).
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! - `connect` is idempotent: a live handle is returned as-is
//! - Reconnects are serialized behind one async mutex so concurrent workers
//!   never race to open parallel connections
//! - Attempts are bounded by `max_reconnect_attempts` with exponential delay;
//!   exhausting them surfaces [`BrokerError::Connection`]
//! - `disconnect` always ends in `Disconnected`; close errors are logged

use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use conveyor_core::config::{env_millis, env_or, env_secs};

use crate::envelope::Event;
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Bounded reconnect behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Connection attempts per `connect` call (minimum 1).
    pub max_reconnect_attempts: u32,
    /// Delay after the first failed attempt; doubles afterwards.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_reconnect_attempts: env_or("BROKER_MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts),
            base_delay: env_millis("BROKER_RECONNECT_DELAY_MS", d.base_delay),
            max_delay: d.max_delay,
            connect_timeout: env_secs("BROKER_CONNECT_TIMEOUT_SECS", d.connect_timeout),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay after failed attempt `attempt` (1-indexed): base * 2^(attempt-1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Shared connection handle plus its lifecycle state.
///
/// Backends keep one slot and hand out clones of the handle to workers.
#[derive(Debug)]
pub struct ConnectionSlot<H> {
    backend: &'static str,
    state: RwLock<ConnectionState>,
    handle: RwLock<Option<H>>,
    reconnect: tokio::sync::Mutex<()>,
    policy: ReconnectPolicy,
}

impl<H: Clone + Send + Sync> ConnectionSlot<H> {
    pub fn new(backend: &'static str, policy: ReconnectPolicy) -> Self {
        Self {
            backend,
            state: RwLock::new(ConnectionState::Disconnected),
            handle: RwLock::new(None),
            reconnect: tokio::sync::Mutex::new(()),
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// The live handle, if connected.
    pub fn handle(&self) -> Option<H> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handle().is_some()
    }

    /// Return the live handle or open a new one.
    pub async fn connect<F, Fut, E>(&self, mut open: F) -> Result<H, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<H, E>>,
        E: core::fmt::Display,
    {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        let _guard = self.reconnect.lock().await;
        // Another worker may have reconnected while we waited.
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        self.set_state(ConnectionState::Connecting);
        let attempts = self.policy.max_reconnect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.connect_timeout, open()).await {
                Ok(Ok(handle)) => {
                    *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
                    self.set_state(ConnectionState::Connected);
                    info!(backend = self.backend, attempt, "broker connected");
                    return Ok(handle);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.policy.connect_timeout)
                }
            }

            warn!(
                backend = self.backend,
                attempt,
                max_attempts = attempts,
                error = %last_error,
                "broker connection attempt failed"
            );

            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(BrokerError::Connection(format!(
            "{} unreachable after {attempts} attempts: {last_error}",
            self.backend
        )))
    }

    /// Close the handle (if any). Always ends in `Disconnected`.
    pub async fn disconnect<F, Fut, E>(&self, close: F)
    where
        F: FnOnce(H) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: core::fmt::Display,
    {
        let _guard = self.reconnect.lock().await;
        let handle = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            self.set_state(ConnectionState::Disconnecting);
            if let Err(e) = close(handle).await {
                warn!(backend = self.backend, error = %e, "error while closing broker connection");
            }
            info!(backend = self.backend, "broker disconnected");
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Forget a handle known to be broken so the next `connect` reopens it.
    pub fn invalidate(&self) {
        self.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Connection lifecycle + publish primitive implemented by every backend.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Registry key of the backend (`redis`, `rabbitmq`, `memory`).
    fn backend(&self) -> &'static str;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the connection. No-op when already connected.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the connection. Never fails; errors are logged.
    async fn disconnect(&self);

    /// Lazily connect before an operation that needs a live handle.
    async fn ensure_connection(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            self.connect().await
        }
    }

    /// Publish one event. Transient failures are reported as
    /// [`BrokerError::Publish`] so callers can retry them.
    async fn publish_message(&self, event: &Event) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(10))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let slot = ConnectionSlot::<u32>::new("test", quick_policy(1));
        let opened = AtomicU32::new(0);

        for _ in 0..3 {
            let handle = slot
                .connect(|| async {
                    opened.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(42)
                })
                .await
                .unwrap();
            assert_eq!(handle, 42);
        }

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(slot.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_bounded() {
        let slot = ConnectionSlot::<u32>::new("test", quick_policy(3));
        let attempts = AtomicU32::new(0);

        let err = slot
            .connect(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>("refused")
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(err, BrokerError::Connection(_)));
        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(slot.handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let slot = ConnectionSlot::<u32>::new("test", quick_policy(3));
        let attempts = AtomicU32::new(0);

        let handle = slot
            .connect(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("refused")
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(handle, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_connects_open_once() {
        let slot = Arc::new(ConnectionSlot::<u32>::new("test", quick_policy(1)));
        let opened = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let slot = slot.clone();
            let opened = opened.clone();
            tasks.push(tokio::spawn(async move {
                slot.connect(|| {
                    let opened = opened.clone();
                    async move {
                        opened.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, String>(1)
                    }
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_always_ends_disconnected() {
        let slot = ConnectionSlot::<u32>::new("test", quick_policy(1));
        slot.connect(|| async { Ok::<_, String>(1) }).await.unwrap();

        slot.disconnect(|_| async { Err::<(), _>("close failed") }).await;

        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(slot.handle().is_none());

        // Disconnecting twice is harmless.
        slot.disconnect(|_| async { Ok::<(), String>(()) }).await;
        assert_eq!(slot.state(), ConnectionState::Disconnected);
    }
}
