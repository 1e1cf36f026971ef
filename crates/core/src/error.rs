//! Error classification shared by every layer.

use thiserror::Error;

/// Coarse cause of a failure.
///
/// Every concrete error enum in the workspace maps onto one of these through a
/// `kind()` accessor, so callers can branch on transient vs permanent causes
/// without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A bounded buffer is at capacity; the caller should back off.
    QueueFull,
    /// The queue no longer accepts work (shutdown in progress).
    QueueClosed,
    /// A submitted callable returned an error or panicked.
    CallableFailure,
    /// The broker rejected or failed a publish.
    PublishFailure,
    /// The broker is unreachable.
    ConnectionFailure,
    /// A payload could not be encoded or decoded.
    SerializationFailure,
    /// A message was processed but the acknowledgement failed.
    AckFailure,
    /// Caller supplied invalid input.
    Validation,
    /// A referenced record does not exist.
    NotFound,
}

impl ErrorKind {
    /// Transient causes are worth retrying; everything else is permanent.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::PublishFailure | ErrorKind::ConnectionFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::QueueClosed => "queue_closed",
            ErrorKind::CallableFailure => "callable_failure",
            ErrorKind::PublishFailure => "publish_failure",
            ErrorKind::ConnectionFailure => "connection_failure",
            ErrorKind::SerializationFailure => "serialization_failure",
            ErrorKind::AckFailure => "ack_failure",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by [`crate::WorkQueue`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Put on a full queue. Never a silent drop, never a blocking wait.
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Full { .. } => ErrorKind::QueueFull,
            QueueError::Closed => ErrorKind::QueueClosed,
        }
    }
}

/// An identifier string could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier: {0}")]
pub struct InvalidId(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_broker_causes_are_transient() {
        assert!(ErrorKind::PublishFailure.is_transient());
        assert!(ErrorKind::ConnectionFailure.is_transient());
        assert!(!ErrorKind::SerializationFailure.is_transient());
        assert!(!ErrorKind::QueueFull.is_transient());
    }

    #[test]
    fn queue_error_maps_to_kind() {
        assert_eq!(QueueError::Full { capacity: 3 }.kind(), ErrorKind::QueueFull);
        assert_eq!(QueueError::Closed.kind(), ErrorKind::QueueClosed);
        assert_eq!(
            QueueError::Full { capacity: 3 }.to_string(),
            "queue is full (capacity 3)"
        );
    }
}
