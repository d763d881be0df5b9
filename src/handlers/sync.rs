//! # Issue Sync API Handlers
//!
//! Manual trigger and job status endpoints. Triggers go through
//! [`SyncRunner::trigger_sync`](crate::sync::SyncRunner::trigger_sync) and so
//! share the scheduler's conflict query.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::issue_sync_job;
use crate::repositories::IssueSyncJobRepository;
use crate::server::AppState;

/// Response for an accepted trigger
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TriggerSyncResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: Uuid,
}

/// Issue sync job status and counters
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: Uuid,
    #[schema(example = 12)]
    pub config_id: i32,
    /// `manual` or `scheduled`
    #[schema(example = "manual")]
    pub job_type: String,
    /// `pending`, `running`, `completed` or `failed`
    #[schema(example = "completed")]
    pub status: String,
    pub source_project_id: i64,
    pub target_project_id: i64,
    pub source_instance_id: i32,
    pub target_instance_id: i32,
    pub issues_processed: i32,
    pub issues_created: i32,
    pub issues_updated: i32,
    pub issues_skipped: i32,
    pub issues_failed: i32,
    /// Run rollup and per-issue errors
    pub error_details: Option<serde_json::Value>,
    #[schema(example = "2025-01-01T00:00:01Z")]
    pub started_at: Option<String>,
    #[schema(example = "2025-01-01T00:02:30Z")]
    pub completed_at: Option<String>,
    pub created_at: String,
}

impl From<issue_sync_job::Model> for JobInfo {
    fn from(model: issue_sync_job::Model) -> Self {
        Self {
            id: model.id,
            config_id: model.config_id,
            job_type: model.job_type,
            status: model.status,
            source_project_id: model.source_project_id,
            target_project_id: model.target_project_id,
            source_instance_id: model.source_instance_id,
            target_instance_id: model.target_instance_id,
            issues_processed: model.issues_processed,
            issues_created: model.issues_created,
            issues_updated: model.issues_updated,
            issues_skipped: model.issues_skipped,
            issues_failed: model.issues_failed,
            error_details: model.error_details,
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Start an issue sync for a config
#[utoipa::path(
    post,
    path = "/configs/{config_id}/sync",
    params(("config_id" = i32, Path, description = "Issue sync config id")),
    responses(
        (status = 202, description = "Sync job started", body = TriggerSyncResponse),
        (status = 404, description = "Config not found", body = ApiError),
        (status = 409, description = "A sync for this config or its reverse direction is in progress", body = ApiError),
        (status = 422, description = "Config or mirror disabled", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(config_id): Path<i32>,
) -> Result<(StatusCode, Json<TriggerSyncResponse>), ApiError> {
    let job_id = state.runner.trigger_sync(config_id).await?;
    tracing::info!(config_id, job_id = %job_id, "Manual issue sync triggered");
    Ok((StatusCode::ACCEPTED, Json(TriggerSyncResponse { job_id })))
}

/// Fetch one issue sync job
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Issue sync job id")),
    responses(
        (status = 200, description = "Job found", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    let job = IssueSyncJobRepository::new(state.db.clone())
        .find_by_id(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&format!("Job {job_id} not found")))?;
    Ok(Json(job.into()))
}

/// List a config's jobs, newest first
#[utoipa::path(
    get,
    path = "/configs/{config_id}/jobs",
    params(("config_id" = i32, Path, description = "Issue sync config id")),
    responses(
        (status = 200, description = "Jobs for the config", body = [JobInfo])
    ),
    tag = "sync"
)]
pub async fn list_config_jobs(
    State(state): State<AppState>,
    Path(config_id): Path<i32>,
) -> Result<Json<Vec<JobInfo>>, ApiError> {
    let jobs = IssueSyncJobRepository::new(state.db.clone())
        .list_for_config(config_id)
        .await?;
    Ok(Json(jobs.into_iter().map(JobInfo::from).collect()))
}
