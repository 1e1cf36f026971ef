use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use conveyor_events::BrokerError;
use conveyor_infra::background::ServiceError;

pub const QUEUE_FULL_MESSAGE: &str = "Event queue is full. Please try again later.";

pub fn json_error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "status": "error",
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn broker_error_to_response(err: BrokerError) -> axum::response::Response {
    match err {
        BrokerError::QueueFull { .. } => json_error(StatusCode::TOO_MANY_REQUESTS, QUEUE_FULL_MESSAGE),
        BrokerError::QueueClosed => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Broker service is shutting down.",
        ),
        BrokerError::Validation(msg) | BrokerError::Serialization(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, msg)
        }
        BrokerError::Connection(_) | BrokerError::NotConnected => {
            json_error(StatusCode::BAD_GATEWAY, err.to_string())
        }
        BrokerError::Publish(_) | BrokerError::Ack(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Queue(e) => broker_error_to_response(BrokerError::from(e)),
        ServiceError::Tracker(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
