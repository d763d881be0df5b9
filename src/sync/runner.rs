//! # Sync Runner
//!
//! Owns the lifecycle of issue sync job units. Manual triggers and the scheduler
//! both start jobs here, so they share the conflict query in
//! [`IssueSyncJobRepository::try_start`] and the same task set, which is drained
//! explicitly on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use metrics::counter;
use sea_orm::{DatabaseConnection, DbErr};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::attachments::AttachmentFetcher;
use super::engine::{EngineDeps, IssueSyncEngine};
use super::{SyncError, SyncOutcome};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::gitlab::GitLabClientFactory;
use crate::models::issue_sync_job::{self, JobStatus, JobType};
use crate::models::mirror_issue_config::SyncStatus;
use crate::repositories::{
    IssueSyncJobRepository, JobCounters, MirrorContext, MirrorIssueConfigRepository, StartCheck,
    StartOutcome,
};
use crate::resilience::CircuitBreakerRegistry;
use crate::telemetry::{TraceContext, with_trace_context};

const INTERRUPTED: &str = "interrupted by shutdown";

/// Reasons a manual trigger is refused.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("issue sync config {0} not found")]
    ConfigNotFound(i32),
    #[error("issue sync config {0} is disabled")]
    ConfigDisabled(i32),
    #[error("a sync is already in progress for this config or project pair (job {job_id})")]
    AlreadyRunning { job_id: Uuid },
    #[error("a sync is replicating the same projects in the opposite direction (job {job_id})")]
    BidirectionalConflict { job_id: Uuid },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        let message = err.to_string();
        match err {
            TriggerError::ConfigNotFound(_) => ApiError::not_found(&message),
            TriggerError::ConfigDisabled(config_id) => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "CONFIG_DISABLED",
                message.as_str(),
            )
            .with_details(serde_json::json!({ "config_id": config_id })),
            TriggerError::AlreadyRunning { job_id } => {
                ApiError::new(StatusCode::CONFLICT, "SYNC_IN_PROGRESS", message.as_str())
                    .with_details(serde_json::json!({ "job_id": job_id }))
            }
            TriggerError::BidirectionalConflict { job_id } => ApiError::new(
                StatusCode::CONFLICT,
                "BIDIRECTIONAL_CONFLICT",
                message.as_str(),
            )
            .with_details(serde_json::json!({ "job_id": job_id })),
            TriggerError::Database(db_err) => ApiError::from(db_err),
        }
    }
}

/// Everything a spawned unit needs; cloned into each task so no session or
/// engine is shared between units.
#[derive(Clone)]
struct UnitServices {
    db: DatabaseConnection,
    config: Arc<AppConfig>,
    breakers: Arc<CircuitBreakerRegistry>,
    factory: Arc<dyn GitLabClientFactory>,
    fetcher: Arc<dyn AttachmentFetcher>,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashMap<Uuid, i32>>>,
}

pub struct SyncRunner {
    services: UnitServices,
    jobs: IssueSyncJobRepository,
    configs: MirrorIssueConfigRepository,
    /// Held across awaits while draining, so it is an async mutex.
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl SyncRunner {
    pub fn new(
        db: DatabaseConnection,
        config: Arc<AppConfig>,
        breakers: Arc<CircuitBreakerRegistry>,
        factory: Arc<dyn GitLabClientFactory>,
        fetcher: Arc<dyn AttachmentFetcher>,
    ) -> Self {
        Self {
            jobs: IssueSyncJobRepository::new(db.clone()),
            configs: MirrorIssueConfigRepository::new(db.clone()),
            services: UnitServices {
                db,
                config,
                breakers,
                factory,
                fetcher,
                cancel: CancellationToken::new(),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            },
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.services.breakers
    }

    /// Job ids of units that have not finished yet.
    pub fn in_flight(&self) -> Vec<Uuid> {
        lock(&self.services.in_flight).keys().copied().collect()
    }

    /// Start a manual sync for `config_id` and return the new job id.
    pub async fn trigger_sync(&self, config_id: i32) -> Result<Uuid, TriggerError> {
        let ctx = self
            .configs
            .load_context(config_id)
            .await?
            .ok_or(TriggerError::ConfigNotFound(config_id))?;
        if !ctx.is_enabled() {
            return Err(TriggerError::ConfigDisabled(config_id));
        }

        match self.start(ctx, JobType::Manual).await? {
            StartOutcome::Started(job) => Ok(job.id),
            StartOutcome::Blocked(StartCheck::BidirectionalConflict { job_id }) => {
                Err(TriggerError::BidirectionalConflict { job_id })
            }
            StartOutcome::Blocked(StartCheck::AlreadyRunning { job_id }) => {
                Err(TriggerError::AlreadyRunning { job_id })
            }
            StartOutcome::Blocked(StartCheck::Clear) => Err(TriggerError::AlreadyRunning {
                job_id: Uuid::nil(),
            }),
        }
    }

    /// Claim a job row for `ctx` and, if that succeeds, spawn its unit.
    pub async fn start(&self, ctx: MirrorContext, job_type: JobType) -> Result<StartOutcome, DbErr> {
        let outcome = self
            .jobs
            .try_start(ctx.config.id, ctx.conflict_keys(), job_type)
            .await?;
        if let StartOutcome::Started(job) = &outcome {
            self.spawn_unit(ctx, job.clone()).await;
        }
        Ok(outcome)
    }

    async fn spawn_unit(&self, ctx: MirrorContext, job: issue_sync_job::Model) {
        let services = self.services.clone();
        lock(&services.in_flight).insert(job.id, ctx.config.id);

        let span = info_span!("issue_sync_job", job_id = %job.id, config_id = ctx.config.id);
        let trace = TraceContext::for_job(job.id);
        let unit = with_trace_context(trace, run_unit(services, ctx, job)).instrument(span);

        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(unit);
    }

    /// Wait until every spawned unit has finished.
    ///
    /// Dropping the returned future (for instance on timeout) leaves the
    /// remaining units running.
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result
                && !err.is_cancelled()
            {
                error!(error = %err, "Issue sync unit panicked");
            }
        }
    }

    /// Wait up to `timeout` for in-flight units, then request cancellation and
    /// give them `grace` to stop at an issue boundary. Units still running
    /// after that are aborted and their jobs failed as interrupted.
    pub async fn shutdown(&self, timeout: Duration, grace: Duration) {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            info!("All issue sync units finished");
            return;
        }

        warn!(
            in_flight = lock(&self.services.in_flight).len(),
            "Shutdown timeout reached, cancelling issue sync units"
        );
        self.services.cancel.cancel();
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return;
        }

        {
            let mut tasks = self.tasks.lock().await;
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let remaining: Vec<(Uuid, i32)> = lock(&self.services.in_flight).drain().collect();
        let retry_in =
            chrono::Duration::seconds(self.services.config.scheduler.conflict_retry_seconds as i64);
        for (job_id, config_id) in remaining {
            warn!(job_id = %job_id, config_id, "Issue sync unit aborted at shutdown");
            let details = serde_json::json!({
                "sync_status": SyncStatus::Failed.as_str(),
                "errors": [{ "error": INTERRUPTED }],
            });
            if let Err(err) = self
                .jobs
                .finish(job_id, JobStatus::Failed, JobCounters::default(), Some(details))
                .await
            {
                error!(job_id = %job_id, error = %err, "Failed to record interrupted job");
            }
            if let Err(err) = self
                .configs
                .finalize(
                    config_id,
                    SyncStatus::Failed,
                    Some(INTERRUPTED.to_string()),
                    Utc::now() + retry_in,
                )
                .await
            {
                error!(config_id, error = %err, "Failed to record interrupted config");
            }
            counter!("issue_sync_jobs_total", "status" => "interrupted").increment(1);
        }
    }
}

/// One job from claim to terminal state.
async fn run_unit(services: UnitServices, ctx: MirrorContext, job: issue_sync_job::Model) {
    let job_id = job.id;
    let config_id = ctx.config.id;
    let interval = services
        .config
        .scheduler
        .clamp_interval_minutes(ctx.config.sync_interval_minutes);

    let result = execute(&services, ctx).await;

    let (status, counters, details, summary) = match &result {
        Ok(outcome) => (
            outcome.status(),
            outcome.counters,
            outcome.error_details(),
            outcome.summary_error(),
        ),
        Err(err) => {
            error!(error = %err, "Issue sync job failed");
            let details = serde_json::json!({
                "sync_status": SyncStatus::Failed.as_str(),
                "errors": [{ "error": err.to_string(), "kind": err.remote_kind() }],
            });
            (SyncStatus::Failed, JobCounters::default(), details, Some(err.to_string()))
        }
    };

    let job_status = match status {
        SyncStatus::Failed => JobStatus::Failed,
        SyncStatus::Success | SyncStatus::Partial => JobStatus::Completed,
    };

    let jobs = IssueSyncJobRepository::new(services.db.clone());
    let configs = MirrorIssueConfigRepository::new(services.db.clone());
    match jobs.finish(job_id, job_status, counters, Some(details)).await {
        Ok(true) => {}
        Ok(false) => warn!("Job was already terminal, keeping its recorded status"),
        Err(err) => error!(error = %err, "Failed to record job result"),
    }

    let next_sync_at = Utc::now() + chrono::Duration::minutes(interval);
    if let Err(err) = configs
        .finalize(config_id, status, summary, next_sync_at)
        .await
    {
        error!(error = %err, "Failed to record config sync status");
    }

    counter!("issue_sync_jobs_total", "status" => status.as_str()).increment(1);
    info!(
        status = status.as_str(),
        processed = counters.processed,
        failed = counters.failed,
        next_sync_at = %next_sync_at,
        "Issue sync job finished"
    );
    lock(&services.in_flight).remove(&job_id);
}

async fn execute(services: &UnitServices, ctx: MirrorContext) -> Result<SyncOutcome, SyncError> {
    let source = services
        .factory
        .client_for(&ctx.source_instance)
        .map_err(SyncError::Remote)?;
    let target = services
        .factory
        .client_for(&ctx.target_instance)
        .map_err(SyncError::Remote)?;

    let engine = IssueSyncEngine::new(
        ctx,
        EngineDeps {
            db: services.db.clone(),
            source,
            target,
            breakers: services.breakers.clone(),
            fetcher: services.fetcher.clone(),
            config: services.config.clone(),
            cancel: services.cancel.clone(),
        },
    );
    engine.sync().await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_errors_map_to_http_statuses() {
        let cases = [
            (TriggerError::ConfigNotFound(1), StatusCode::NOT_FOUND),
            (TriggerError::ConfigDisabled(1), StatusCode::UNPROCESSABLE_ENTITY),
            (
                TriggerError::AlreadyRunning {
                    job_id: Uuid::new_v4(),
                },
                StatusCode::CONFLICT,
            ),
            (
                TriggerError::BidirectionalConflict {
                    job_id: Uuid::new_v4(),
                },
                StatusCode::CONFLICT,
            ),
            (
                TriggerError::Database(DbErr::Custom("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn conflict_codes_are_distinguishable() {
        let duplicate = ApiError::from(TriggerError::AlreadyRunning {
            job_id: Uuid::nil(),
        });
        let reverse = ApiError::from(TriggerError::BidirectionalConflict {
            job_id: Uuid::nil(),
        });
        assert_eq!(&*duplicate.code, "SYNC_IN_PROGRESS");
        assert_eq!(&*reverse.code, "BIDIRECTIONAL_CONFLICT");
    }
}
