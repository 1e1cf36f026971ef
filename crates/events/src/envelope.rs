use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use conveyor_core::{ContentType, Payload, Serializer};

use crate::error::BrokerError;

/// Retry budget applied when the caller does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// One outbound broker message.
///
/// Notes:
/// - The body is encoded when the event is built, so malformed payloads are
///   rejected before they reach the event queue.
/// - `destination` is an exchange (RabbitMQ) or a stream (Redis).
/// - `attributes` carry backend-specific extras; a `headers` object is
///   forwarded as message headers where the backend supports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    event_id: Uuid,
    destination: String,
    routing_key: String,
    content_type: ContentType,
    body: Vec<u8>,
    max_retries: u32,
    attributes: Map<String, Value>,
}

impl Event {
    /// Encode `payload` with its natural content type.
    pub fn new(
        destination: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &Payload,
    ) -> Result<Self, BrokerError> {
        let encoded = Serializer.encode(payload)?;
        Self::from_encoded(destination, routing_key, encoded.content_type, encoded.body)
    }

    /// Build from an already-encoded body.
    pub fn from_encoded(
        destination: impl Into<String>,
        routing_key: impl Into<String>,
        content_type: ContentType,
        body: Vec<u8>,
    ) -> Result<Self, BrokerError> {
        let destination = destination.into();
        if destination.trim().is_empty() {
            return Err(BrokerError::Validation("destination is required".to_string()));
        }

        Ok(Self {
            event_id: Uuid::now_v7(),
            destination,
            routing_key: routing_key.into(),
            content_type,
            body,
            max_retries: DEFAULT_MAX_RETRIES,
            attributes: Map::new(),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// The `headers` attribute, if it is an object.
    pub fn headers(&self) -> Option<&Map<String, Value>> {
        self.attributes.get("headers").and_then(Value::as_object)
    }

    /// Decode the body back into a payload.
    pub fn payload(&self) -> Result<Payload, BrokerError> {
        Ok(Serializer.decode(&self.body, Some(self.content_type.mime()))?)
    }

    /// `destination.routing_key`, used in logs and API responses.
    pub fn qualified_name(&self) -> String {
        if self.routing_key.is_empty() {
            self.destination.clone()
        } else {
            format!("{}.{}", self.destination, self.routing_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_is_encoded_at_construction() {
        let event = Event::new("navigator", "orders.created", &Payload::from(json!({"id": 1}))).unwrap();

        assert_eq!(event.content_type(), ContentType::Json);
        assert_eq!(event.body(), br#"{"id":1}"#);
        assert_eq!(event.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(event.qualified_name(), "navigator.orders.created");
        assert_eq!(event.payload().unwrap(), Payload::Json(json!({"id": 1})));
    }

    #[test]
    fn destination_is_required() {
        let err = Event::new("  ", "key", &Payload::from("x")).unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }

    #[test]
    fn headers_come_from_attributes() {
        let event = Event::new("ex", "rk", &Payload::from("x"))
            .unwrap()
            .with_attribute("headers", json!({"tenant": "t1"}))
            .with_attribute("priority", json!("high"));

        assert_eq!(event.headers().unwrap()["tenant"], json!("t1"));
        assert_eq!(event.attributes().len(), 2);
    }
}
