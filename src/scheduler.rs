//! # Issue Sync Scheduler
//!
//! Background tick loop that recovers stale jobs and starts a job unit for every
//! due issue sync config. Mutual exclusion lives entirely in the job table: a
//! config is started only through [`SyncRunner::start`], which shares its
//! conflict query with manual triggers, so several scheduler instances and the
//! HTTP trigger can run side by side.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::error::{ApiError, map_db_err};
use crate::models::issue_sync_job::JobType;
use crate::models::mirror_issue_config::SyncStatus;
use crate::repositories::{
    IssueSyncJobRepository, MirrorIssueConfigRepository, StartCheck, StartOutcome,
};
use crate::sync::SyncRunner;

/// Background scheduler service.
pub struct IssueSyncScheduler {
    config: Arc<AppConfig>,
    runner: Arc<SyncRunner>,
    jobs: IssueSyncJobRepository,
    configs: MirrorIssueConfigRepository,
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub stale_recovered: u64,
    pub configs_due: u64,
    pub jobs_started: u64,
    pub skipped_running: u64,
    pub skipped_conflict: u64,
    pub skipped_disabled: u64,
    pub configs_with_errors: u64,
}

impl IssueSyncScheduler {
    pub fn new(
        config: Arc<AppConfig>,
        db: sea_orm::DatabaseConnection,
        runner: Arc<SyncRunner>,
    ) -> Self {
        Self {
            config,
            runner,
            jobs: IssueSyncJobRepository::new(db.clone()),
            configs: MirrorIssueConfigRepository::new(db),
        }
    }

    /// Run the scheduler loop until `shutdown` fires, then drain in-flight units.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ApiError> {
        info!(
            tick_interval_seconds = self.config.scheduler.tick_interval_seconds,
            "Starting issue sync scheduler"
        );
        let tick_interval = self.config.scheduler.tick_interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Issue sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Scheduler tick failed");
                    }
                    let elapsed = tick_started.elapsed();
                    histogram!("issue_sync_scheduler_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        self.runner
            .shutdown(
                self.config.scheduler.shutdown_timeout(),
                self.config.scheduler.cancel_grace(),
            )
            .await;
        info!("Issue sync scheduler stopped");
        Ok(())
    }

    /// One pass: stale recovery first, so a crashed job's locks are released
    /// before due configs are evaluated.
    pub async fn tick(&self) -> Result<TickStats, ApiError> {
        let now = Utc::now();
        let mut stats = TickStats {
            stale_recovered: self.recover_stale(now).await?,
            ..TickStats::default()
        };

        let due = self
            .configs
            .find_due(now, self.config.scheduler.max_configs_per_tick)
            .await
            .map_err(|err| map_db_err("failed to load due issue sync configs", err))?;
        stats.configs_due = due.len() as u64;

        for config in due {
            if let Err(err) = self.process_config(config.id, now, &mut stats).await {
                stats.configs_with_errors += 1;
                error!(error = ?err, config_id = config.id, "Failed to schedule issue sync config");
            }
        }

        debug!(
            stale_recovered = stats.stale_recovered,
            due = stats.configs_due,
            started = stats.jobs_started,
            skipped_running = stats.skipped_running,
            skipped_conflict = stats.skipped_conflict,
            skipped_disabled = stats.skipped_disabled,
            errors = stats.configs_with_errors,
            "Scheduler tick completed"
        );
        Ok(stats)
    }

    /// Fail every live job older than the stale timeout and make its config due again.
    async fn recover_stale(&self, now: DateTime<Utc>) -> Result<u64, ApiError> {
        let timeout = Duration::minutes(self.config.scheduler.stale_job_timeout_minutes as i64);
        let stale = self
            .jobs
            .find_stale(now, timeout)
            .await
            .map_err(|err| map_db_err("failed to load stale issue sync jobs", err))?;

        let mut recovered = 0;
        for job in stale {
            let failed = self
                .jobs
                .fail_stale(&job, timeout)
                .await
                .map_err(|err| map_db_err("failed to mark stale job failed", err))?;
            if !failed {
                continue;
            }
            recovered += 1;
            warn!(
                job_id = %job.id,
                config_id = job.config_id,
                status = %job.status,
                "Recovered stale issue sync job"
            );
            self.configs
                .finalize(
                    job.config_id,
                    SyncStatus::Failed,
                    Some("job exceeded the stale timeout and was recovered".to_string()),
                    now,
                )
                .await
                .map_err(|err| map_db_err("failed to update config of stale job", err))?;
        }

        if recovered > 0 {
            counter!("issue_sync_stale_jobs_recovered_total").increment(recovered);
        }
        Ok(recovered)
    }

    async fn process_config(
        &self,
        config_id: i32,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Result<(), ApiError> {
        let Some(ctx) = self
            .configs
            .load_context(config_id)
            .await
            .map_err(|err| map_db_err("failed to load issue sync config", err))?
        else {
            return Ok(());
        };

        if !ctx.is_enabled() {
            stats.skipped_disabled += 1;
            let interval = self
                .config
                .scheduler
                .clamp_interval_minutes(ctx.config.sync_interval_minutes);
            self.configs
                .reschedule(config_id, now + Duration::minutes(interval))
                .await
                .map_err(|err| map_db_err("failed to reschedule issue sync config", err))?;
            debug!(config_id, "Mirror disabled; deferring issue sync");
            return Ok(());
        }

        let outcome = self
            .runner
            .start(ctx, JobType::Scheduled)
            .await
            .map_err(|err| map_db_err("failed to start issue sync job", err))?;

        match outcome {
            StartOutcome::Started(job) => {
                stats.jobs_started += 1;
                info!(job_id = %job.id, config_id, "Scheduled issue sync job started");
            }
            StartOutcome::Blocked(StartCheck::BidirectionalConflict { job_id }) => {
                stats.skipped_conflict += 1;
                let retry_at = now
                    + Duration::seconds(self.config.scheduler.conflict_retry_seconds as i64);
                self.configs
                    .reschedule(config_id, retry_at)
                    .await
                    .map_err(|err| map_db_err("failed to reschedule conflicting config", err))?;
                info!(
                    config_id,
                    blocking_job_id = %job_id,
                    retry_at = %retry_at,
                    "Reverse-direction sync in progress; deferring"
                );
            }
            StartOutcome::Blocked(StartCheck::AlreadyRunning { job_id }) => {
                stats.skipped_running += 1;
                debug!(config_id, blocking_job_id = %job_id, "Sync already in progress; skipping");
            }
            StartOutcome::Blocked(StartCheck::Clear) => {
                stats.skipped_running += 1;
            }
        }
        Ok(())
    }
}
