//! Queued job status lookup.

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::queue::JobInfo;
use crate::server::AppState;

/// GET /jobs/{id} - Current state of an enqueued job
#[tracing::instrument(name = "http.job_status", skip(state))]
pub async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobInfo>> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::Validation(format!("invalid job id '{}'", id)))?;

    match state.queue().job_status(id).await? {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::NotFound(format!("job {}", id))),
    }
}
