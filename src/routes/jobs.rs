use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::job::{JobId, JobStatus};
use crate::routes::{api_error, ApiError};

/// GET /api/v1/jobs/{*job_id}: current registry entry for a job.
///
/// Job IDs contain slashes, so the whole remaining path is the ID.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let id = JobId::from(job_id.trim_start_matches('/'));
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("job {id} not found")))
}
