//! `conveyor-events`: broker pipeline mechanics.
//!
//! Backends (Redis Streams, RabbitMQ) live in `conveyor-infra`; this crate
//! only knows the contracts and the transport-independent loops.

pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod in_memory_bus;
pub mod producer;

pub use connection::{BrokerConnection, ConnectionSlot, ConnectionState, ReconnectPolicy};
pub use consumer::{
    BrokerConsumer, Delivery, ExchangeType, Message, MessageHandler, MessageSource,
    SubscribeOptions,
};
pub use envelope::{DEFAULT_MAX_RETRIES, Event};
pub use error::{BrokerError, BrokerResult};
pub use in_memory_bus::InMemoryBroker;
pub use producer::{BrokerProducer, DeadLetterSink, LogDeadLetters, ProducerConfig, ProducerStats};
