use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::core::orchestrator::JobRequest;

use super::super::AppState;
use super::error_response;

const DEFAULT_JOB_LIMIT: usize = 100;
const MAX_JOB_LIMIT: usize = 1000;
const DEFAULT_LOG_LIMIT: usize = 1000;

#[derive(Deserialize)]
pub struct JobsQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct LogQuery {
    /// Return entries with a sequence number above this one.
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct RescheduleRequest {
    pub schedule_at: String,
    pub timezone: Option<String>,
}

pub async fn create_job(State(state): State<AppState>, Json(request): Json<JobRequest>) -> Response {
    match state.orchestrator.create_job(request).await {
        Ok(job) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "success": true, "job": job })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_jobs(Query(query): Query<JobsQuery>, State(state): State<AppState>) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_JOB_LIMIT)
        .clamp(1, MAX_JOB_LIMIT);
    match state.orchestrator.jobs(limit).await {
        Ok(jobs) => Json(serde_json::json!({ "success": true, "jobs": jobs })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_job(Path(job_id): Path<String>, State(state): State<AppState>) -> Response {
    match state.orchestrator.job(&job_id).await {
        Ok(job) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_job_log(
    Path(job_id): Path<String>,
    Query(query): Query<LogQuery>,
    State(state): State<AppState>,
) -> Response {
    let after = query.after.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).max(1);
    match state.orchestrator.job_log(&job_id, after, limit).await {
        Ok(entries) => {
            Json(serde_json::json!({ "success": true, "entries": entries })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn cancel_job(Path(job_id): Path<String>, State(state): State<AppState>) -> Response {
    match state.orchestrator.cancel(&job_id).await {
        Ok(job) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn reschedule_job(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<RescheduleRequest>,
) -> Response {
    match state
        .orchestrator
        .reschedule(&job_id, &payload.schedule_at, payload.timezone.as_deref())
        .await
    {
        Ok(job) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Err(e) => error_response(e),
    }
}
