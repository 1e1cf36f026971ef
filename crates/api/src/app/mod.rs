//! HTTP API application wiring (Axum router + shared state).
//!
//! - `routes/`: HTTP handlers (broker publishing, job status, health)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use conveyor_infra::background::BackgroundService;

use crate::middleware::{self, SessionResolver};
use crate::registry::BrokerServices;

pub mod dto;
pub mod errors;
pub mod routes;

/// Values applied to publish requests that leave them out.
#[derive(Debug, Clone)]
pub struct PublishDefaults {
    pub destination: String,
    pub max_retries: u32,
}

/// Everything the router needs, built by the caller.
#[derive(Clone)]
pub struct AppState {
    pub brokers: Arc<BrokerServices>,
    pub jobs: BackgroundService,
    pub sessions: Arc<dyn SessionResolver>,
    pub defaults: PublishDefaults,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    let auth_state = middleware::AuthState {
        sessions: state.sessions,
    };

    // Protected routes: require a session with a user.
    let protected = routes::router()
        .layer(Extension(state.defaults))
        .layer(Extension(state.jobs))
        .layer(Extension(state.brokers.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .layer(Extension(state.brokers))
        .merge(protected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use conveyor_infra::background::{BackgroundQueue, InMemoryJobTracker, QueueConfig};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::middleware::StaticSessions;

    fn app() -> Router {
        let queue = Arc::new(BackgroundQueue::new(QueueConfig::default()));
        build_app(AppState {
            brokers: Arc::new(BrokerServices::new()),
            jobs: BackgroundService::new(queue, Arc::new(InMemoryJobTracker::new())),
            sessions: Arc::new(StaticSessions::new().with_token("t", Some("alice"))),
            defaults: PublishDefaults {
                destination: "navigator".to_string(),
                max_retries: 5,
            },
        })
    }

    #[tokio::test]
    async fn health_needs_no_session() {
        let res = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(&to_bytes(res.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["brokers"], Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn protected_routes_reject_anonymous_requests() {
        let res = app()
            .oneshot(
                Request::post("/api/v1/broker/events/publish_event")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"routing_key":"a","body":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
