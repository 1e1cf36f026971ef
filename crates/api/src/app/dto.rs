use serde::Serialize;
use serde_json::{Map, Value};

use conveyor_core::Payload;
use conveyor_events::{BrokerError, Event};

/// Body of `POST /api/v1/broker/{service}/publish_event`.
///
/// `queue_name` (or `exchange`) picks the destination, `routing_key` and
/// `body` are required, `max_retries` overrides the retry budget, and every
/// other key (including `headers`) travels as an event attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishEventRequest {
    pub destination: String,
    pub routing_key: String,
    pub body: Value,
    pub max_retries: Option<u32>,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishValidation {
    MissingRoutingKey,
    MissingBody,
}

impl PublishValidation {
    pub fn message(&self) -> &'static str {
        match self {
            PublishValidation::MissingRoutingKey => "routing_key is required.",
            PublishValidation::MissingBody => "Message Body for Broker is required.",
        }
    }
}

impl PublishEventRequest {
    pub fn parse(mut data: Map<String, Value>, default_destination: &str) -> Result<Self, PublishValidation> {
        let destination = ["queue_name", "exchange"]
            .into_iter()
            .filter_map(|key| data.remove(key))
            .find_map(|v| non_empty_string(&v))
            .unwrap_or_else(|| default_destination.to_string());

        let routing_key = data
            .remove("routing_key")
            .as_ref()
            .and_then(non_empty_string)
            .ok_or(PublishValidation::MissingRoutingKey)?;

        let body = data
            .remove("body")
            .filter(|b| !is_blank(b))
            .ok_or(PublishValidation::MissingBody)?;

        let max_retries = data
            .remove("max_retries")
            .and_then(|v| v.as_u64())
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX));

        Ok(Self {
            destination,
            routing_key,
            body,
            max_retries,
            attributes: data,
        })
    }

    pub fn into_event(self, default_max_retries: u32) -> Result<Event, BrokerError> {
        Ok(Event::new(self.destination, self.routing_key, &Payload::from_json(self.body))?
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries))
            .with_attributes(self.attributes))
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Null, `false`, zero and empty strings/arrays/objects do not count as a body.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<PublishEventRequest, PublishValidation> {
        let Value::Object(map) = v else {
            panic!("test payloads are objects");
        };
        PublishEventRequest::parse(map, "navigator")
    }

    #[test]
    fn destination_falls_back_to_exchange_then_default() {
        let req = parse(json!({"exchange": "orders", "routing_key": "a", "body": 1})).unwrap();
        assert_eq!(req.destination, "orders");

        let req = parse(json!({"queue_name": "q", "exchange": "orders", "routing_key": "a", "body": 1})).unwrap();
        assert_eq!(req.destination, "q");

        let req = parse(json!({"routing_key": "a", "body": "x"})).unwrap();
        assert_eq!(req.destination, "navigator");
    }

    #[test]
    fn routing_key_is_checked_before_body() {
        assert_eq!(parse(json!({})), Err(PublishValidation::MissingRoutingKey));
        assert_eq!(
            parse(json!({"routing_key": "  ", "body": "x"})),
            Err(PublishValidation::MissingRoutingKey)
        );
        for blank in [json!(null), json!(""), json!({}), json!([]), json!(0), json!(false)] {
            assert_eq!(
                parse(json!({"routing_key": "a", "body": blank})),
                Err(PublishValidation::MissingBody)
            );
        }
    }

    #[test]
    fn extras_become_attributes() {
        let req = parse(json!({
            "routing_key": "user.created",
            "body": {"id": 1},
            "max_retries": 2,
            "headers": {"tenant": "acme"},
            "trace": "abc",
        }))
        .unwrap();

        assert_eq!(req.max_retries, Some(2));
        let event = req.into_event(5).unwrap();
        assert_eq!(event.max_retries(), 2);
        assert_eq!(event.attributes().get("trace"), Some(&json!("abc")));
        assert_eq!(event.headers().and_then(|h| h.get("tenant")), Some(&json!("acme")));
    }
}
