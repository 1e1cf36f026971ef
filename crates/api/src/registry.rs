//! Broker backends by name, and the producer/consumer pair built on each.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use conveyor_events::{
    BrokerConnection, BrokerConsumer, BrokerError, BrokerProducer, InMemoryBroker, MessageHandler,
    MessageSource, ProducerConfig, SubscribeOptions,
};

/// One backend instance seen through both of its contracts.
#[derive(Clone)]
pub struct BrokerBackend {
    pub connection: Arc<dyn BrokerConnection>,
    pub source: Arc<dyn MessageSource>,
}

impl BrokerBackend {
    pub fn new<B>(broker: Arc<B>) -> Self
    where
        B: MessageSource + 'static,
    {
        Self {
            connection: broker.clone(),
            source: broker,
        }
    }
}

pub type BackendFactory = Arc<dyn Fn() -> Result<BrokerBackend, BrokerError> + Send + Sync>;

/// Name -> backend factory. `memory` is always available; `redis` and
/// `rabbitmq` follow the crate features.
#[derive(Clone)]
pub struct BrokerRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("memory", || Ok(BrokerBackend::new(Arc::new(InMemoryBroker::new()))));

        #[cfg(feature = "redis")]
        registry.register("redis", || {
            use conveyor_infra::broker::{RedisConfig, RedisStreamsBroker};
            let broker = RedisStreamsBroker::new(RedisConfig::from_env())?;
            Ok(BrokerBackend::new(Arc::new(broker)))
        });

        #[cfg(feature = "rabbitmq")]
        registry.register("rabbitmq", || {
            use conveyor_infra::broker::{RabbitMqBroker, RabbitMqConfig};
            Ok(BrokerBackend::new(Arc::new(RabbitMqBroker::new(RabbitMqConfig::from_env()))))
        });

        registry
    }
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<BrokerBackend, BrokerError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str) -> Result<BrokerBackend, BrokerError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            BrokerError::Validation(format!(
                "unknown broker backend '{name}' (available: {})",
                self.keys().join(", ")
            ))
        })?;
        factory()
    }
}

/// Producer + consumer sharing one backend.
pub struct BrokerManager {
    name: String,
    producer: BrokerProducer,
    consumer: BrokerConsumer,
}

impl BrokerManager {
    pub fn new(name: impl Into<String>, backend: BrokerBackend, config: ProducerConfig) -> Self {
        Self {
            name: name.into(),
            producer: BrokerProducer::new(backend.connection, config),
            consumer: BrokerConsumer::new(backend.source),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn producer(&self) -> &BrokerProducer {
        &self.producer
    }

    pub fn consumer(&self) -> &BrokerConsumer {
        &self.consumer
    }

    pub async fn start(&self) -> Result<(), BrokerError> {
        self.producer.start().await
    }

    pub async fn subscribe(&self, options: SubscribeOptions, handler: MessageHandler) -> Result<(), BrokerError> {
        self.consumer.subscribe_to_events(options, handler).await
    }

    /// Consumers first, so nothing new is handled while the producer drains.
    pub async fn stop(&self) {
        self.consumer.stop_consumer().await;
        self.producer.stop().await;
        info!(service = %self.name, "broker manager stopped");
    }
}

/// Started managers keyed by service name (the `{service}` path segment).
#[derive(Default, Clone)]
pub struct BrokerServices {
    managers: HashMap<String, Arc<BrokerManager>>,
}

impl BrokerServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, manager: BrokerManager) -> Arc<BrokerManager> {
        let manager = Arc::new(manager);
        if self
            .managers
            .insert(manager.name().to_string(), manager.clone())
            .is_some()
        {
            warn!(service = %manager.name(), "broker service registered twice, keeping the latest");
        }
        manager
    }

    pub fn get(&self, service: &str) -> Option<&Arc<BrokerManager>> {
        self.managers.get(service)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.managers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn stop_all(&self) {
        for manager in self.managers.values() {
            manager.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_lists_the_known_ones() {
        let registry = BrokerRegistry::new();
        let Err(err) = registry.build("kafka") else {
            panic!("kafka is not registered");
        };
        assert!(err.to_string().contains("memory"));
    }

    #[tokio::test]
    async fn manager_starts_and_stops_its_backend() {
        let backend = BrokerRegistry::new().build("memory").unwrap();
        let connection = backend.connection.clone();
        let manager = BrokerManager::new("events", backend, ProducerConfig::default());

        manager.start().await.unwrap();
        assert!(connection.is_connected());
        assert!(manager.producer().is_running());

        let mut services = BrokerServices::new();
        services.insert(manager);
        assert_eq!(services.names(), vec!["events"]);

        services.stop_all().await;
        assert!(!connection.is_connected());
    }
}
