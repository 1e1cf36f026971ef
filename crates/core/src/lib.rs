//! `conveyor-core`: building blocks shared by the background queue and the
//! broker pipeline.
//!
//! Nothing in here performs network I/O.

pub mod config;
pub mod error;
pub mod id;
pub mod queue;
pub mod serializer;

pub use error::{ErrorKind, InvalidId, QueueError};
pub use id::TaskId;
pub use queue::WorkQueue;
pub use serializer::{ContentType, Encoded, Payload, SerializationError, Serializer};
