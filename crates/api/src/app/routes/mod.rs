use axum::{
    Router,
    routing::{get, post},
};

pub mod broker;
pub mod jobs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/api/v1/broker/:service/publish_event", post(broker::publish_event))
        .route("/api/v1/jobs/:task_id", get(jobs::job_status))
}
