//! Broker backends.
//!
//! The contracts and the producer/consumer loops live in `conveyor-events`;
//! each backend here implements `BrokerConnection` and `MessageSource`.

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::{RabbitMqBroker, RabbitMqConfig};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisConfig, RedisStreamsBroker};
