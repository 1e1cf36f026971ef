use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use conveyor_core::TaskId;
use conveyor_infra::background::BackgroundService;

use crate::app::errors::{json_error, service_error_to_response};

pub async fn job_status(
    Path(task_id): Path<String>,
    Extension(jobs): Extension<BackgroundService>,
) -> Response {
    let Ok(task_id) = task_id.parse::<TaskId>() else {
        return json_error(StatusCode::UNPROCESSABLE_ENTITY, "Invalid task id.");
    };

    match jobs.record(task_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Job not found."),
        Err(e) => service_error_to_response(e),
    }
}
