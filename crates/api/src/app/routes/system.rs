use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};
use serde_json::json;

use crate::registry::BrokerServices;

pub async fn health(Extension(brokers): Extension<Arc<BrokerServices>>) -> impl IntoResponse {
    let services: Vec<_> = brokers
        .names()
        .into_iter()
        .filter_map(|name| brokers.get(name))
        .map(|manager| {
            json!({
                "service": manager.name(),
                "backend": manager.producer().backend(),
                "connected": manager.producer().broker().is_connected(),
                "pending": manager.producer().stats().pending,
            })
        })
        .collect();

    Json(json!({ "status": "ok", "brokers": services }))
}
