use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;

use crate::app_state::AppState;
use crate::error::PipelineError;
use crate::models::api::{JobListResponse, ListJobsQuery, ResultsQuery, ResultsResponse, StatusResponse};

fn query<T>(extracted: Result<Query<T>, QueryRejection>) -> Result<T, PipelineError> {
    extracted
        .map(|Query(q)| q)
        .map_err(|e| PipelineError::InvalidRequest(e.body_text()))
}

/// GET /status/{job_id}
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, PipelineError> {
    Ok(Json(state.status.get_status(&job_id).await?))
}

/// GET /results/{job_id}?detailed=true
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    params: Result<Query<ResultsQuery>, QueryRejection>,
) -> Result<Json<ResultsResponse>, PipelineError> {
    let params = query(params)?;
    Ok(Json(state.status.get_results(&job_id, params.detailed).await?))
}

/// GET /jobs?status=&limit=
pub async fn list_jobs(
    State(state): State<AppState>,
    params: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<JobListResponse>, PipelineError> {
    let params = query(params)?;
    Ok(Json(state.status.list_jobs(params.status, params.limit).await?))
}
