use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::models::{JobState, JobStatusResponse};
use crate::AppState;

/// GET /api/jobs/:job_id - job state with progress and, once completed,
/// the cached metadata
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let job = state.queue.get_job(&job_id).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Job não encontrado" })),
        )
    })?;

    let progress = state
        .progress
        .get(&job.hash)
        .await
        .and_then(|p| serde_json::to_value(p).ok());

    let data = if job.state == JobState::Completed {
        state.cache.get(&job.hash).await
    } else {
        None
    };

    Ok(Json(JobStatusResponse {
        status: job.state.to_string(),
        progress,
        data,
        error: job.error,
        attempts_made: job.attempts_made,
        max_attempts: job.max_attempts,
    }))
}
