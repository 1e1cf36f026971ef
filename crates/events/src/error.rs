//! Broker error model.

use thiserror::Error;

use conveyor_core::{ErrorKind, QueueError, SerializationError};

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable after the bounded reconnect attempts.
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("not connected to broker")]
    NotConnected,

    /// Transient publish failure (timeout, connection reset, nack).
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("invalid event: {0}")]
    Validation(String),

    #[error("event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("event queue is closed")]
    QueueClosed,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Connection(_) | BrokerError::NotConnected => ErrorKind::ConnectionFailure,
            BrokerError::Publish(_) => ErrorKind::PublishFailure,
            BrokerError::Serialization(_) => ErrorKind::SerializationFailure,
            BrokerError::Ack(_) => ErrorKind::AckFailure,
            BrokerError::Validation(_) => ErrorKind::Validation,
            BrokerError::QueueFull { .. } => ErrorKind::QueueFull,
            BrokerError::QueueClosed => ErrorKind::QueueClosed,
        }
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    pub fn publish(msg: impl core::fmt::Display) -> Self {
        Self::Publish(msg.to_string())
    }

    pub fn connection(msg: impl core::fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }
}

impl From<SerializationError> for BrokerError {
    fn from(value: SerializationError) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<QueueError> for BrokerError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Full { capacity } => Self::QueueFull { capacity },
            QueueError::Closed => Self::QueueClosed,
        }
    }
}
