use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{info, warn};

use crate::app::PublishDefaults;
use crate::app::dto::{PublishEventRequest, StatusResponse};
use crate::app::errors::{broker_error_to_response, json_error};
use crate::context::UserContext;
use crate::registry::BrokerServices;

/// Queue an event on the named broker service for background publishing.
pub async fn publish_event(
    Path(service): Path<String>,
    Extension(brokers): Extension<Arc<BrokerServices>>,
    Extension(defaults): Extension<PublishDefaults>,
    Extension(user): Extension<UserContext>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Some(manager) = brokers.get(&service) else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Unknown broker service '{service}'."),
        );
    };

    let data = match payload {
        Ok(Json(Value::Object(data))) => data,
        Ok(_) => {
            return json_error(StatusCode::UNPROCESSABLE_ENTITY, "Request body must be a JSON object.");
        }
        Err(rejection) => return json_error(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    let request = match PublishEventRequest::parse(data, &defaults.destination) {
        Ok(request) => request,
        Err(invalid) => return json_error(StatusCode::UNPROCESSABLE_ENTITY, invalid.message()),
    };

    let event = match request.into_event(defaults.max_retries) {
        Ok(event) => event,
        Err(e) => return broker_error_to_response(e),
    };
    let name = event.qualified_name();

    match manager.producer().queue_event(event).await {
        Ok(()) => {
            info!(service = %service, event = %name, user_id = %user.user_id(), "event accepted");
            Json(StatusResponse::success(format!("Event {name} Published Successfully."))).into_response()
        }
        Err(e) => {
            warn!(service = %service, event = %name, error = %e, "event rejected");
            broker_error_to_response(e)
        }
    }
}
