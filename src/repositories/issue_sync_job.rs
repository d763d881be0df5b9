//! # IssueSyncJob Repository
//!
//! Job rows double as the concurrency lock: a config may start a sync only while
//! no non-terminal row blocks it. Both manual triggers and the scheduler go
//! through [`IssueSyncJobRepository::try_start`], so they share one conflict query.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{is_unique_violation, to_db_time};
use crate::models::issue_sync_job::{
    ActiveModel, Column, ConflictKeys, Entity, JobStatus, JobType, Model,
};

/// Per-issue outcome tallies written to a finished job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Result of the start-eligibility query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCheck {
    Clear,
    /// A live job exists for this config, or for the same direction on the same projects.
    AlreadyRunning { job_id: Uuid },
    /// A live job replicates the same projects in the opposite direction.
    BidirectionalConflict { job_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Model),
    Blocked(StartCheck),
}

#[derive(Debug, Clone)]
pub struct IssueSyncJobRepository {
    db: DatabaseConnection,
}

fn active_filter() -> sea_orm::sea_query::SimpleExpr {
    Column::Status.is_in(JobStatus::ACTIVE)
}

fn keys_condition(keys: &ConflictKeys) -> Condition {
    Condition::all()
        .add(Column::SourceProjectId.eq(keys.source_project_id))
        .add(Column::TargetProjectId.eq(keys.target_project_id))
        .add(Column::SourceInstanceId.eq(keys.source_instance_id))
        .add(Column::TargetInstanceId.eq(keys.target_instance_id))
}

/// Decide whether a job for `config_id` with `keys` may start.
///
/// Duplicates are reported before bidirectional conflicts, so re-triggering
/// the same direction is never mistaken for a reverse sync.
pub async fn check_can_start<C: ConnectionTrait>(
    conn: &C,
    config_id: i32,
    keys: &ConflictKeys,
) -> Result<StartCheck, DbErr> {
    let same_direction = Entity::find()
        .filter(active_filter())
        .filter(
            Condition::any()
                .add(Column::ConfigId.eq(config_id))
                .add(keys_condition(keys)),
        )
        .order_by_asc(Column::CreatedAt)
        .one(conn)
        .await?;
    if let Some(job) = same_direction {
        return Ok(StartCheck::AlreadyRunning { job_id: job.id });
    }

    let reverse = Entity::find()
        .filter(active_filter())
        .filter(keys_condition(&keys.reversed()))
        .order_by_asc(Column::CreatedAt)
        .one(conn)
        .await?;
    if let Some(job) = reverse {
        return Ok(StartCheck::BidirectionalConflict { job_id: job.id });
    }

    Ok(StartCheck::Clear)
}

impl IssueSyncJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn check_can_start(
        &self,
        config_id: i32,
        keys: &ConflictKeys,
    ) -> Result<StartCheck, DbErr> {
        check_can_start(&self.db, config_id, keys).await
    }

    /// Atomically check eligibility and insert a `running` job.
    ///
    /// The partial unique index on live jobs per config catches two callers
    /// that both passed the check; the loser gets `AlreadyRunning`.
    pub async fn try_start(
        &self,
        config_id: i32,
        keys: ConflictKeys,
        job_type: JobType,
    ) -> Result<StartOutcome, DbErr> {
        let txn = self.db.begin().await?;

        let check = check_can_start(&txn, config_id, &keys).await?;
        if check != StartCheck::Clear {
            txn.rollback().await?;
            return Ok(StartOutcome::Blocked(check));
        }

        let now = to_db_time(Utc::now());
        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            config_id: Set(config_id),
            job_type: Set(job_type.as_str().to_string()),
            status: Set(JobStatus::Running.as_str().to_string()),
            source_project_id: Set(keys.source_project_id),
            target_project_id: Set(keys.target_project_id),
            source_instance_id: Set(keys.source_instance_id),
            target_instance_id: Set(keys.target_instance_id),
            issues_processed: Set(0),
            issues_created: Set(0),
            issues_updated: Set(0),
            issues_skipped: Set(0),
            issues_failed: Set(0),
            error_details: Set(None),
            started_at: Set(Some(now)),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match job.insert(&txn).await {
            Ok(model) => {
                txn.commit().await?;
                tracing::info!(
                    job_id = %model.id,
                    config_id,
                    job_type = job_type.as_str(),
                    "Issue sync job started"
                );
                Ok(StartOutcome::Started(model))
            }
            Err(err) if is_unique_violation(&err) => {
                txn.rollback().await?;
                let check = self.check_can_start(config_id, &keys).await?;
                let blocked = match check {
                    StartCheck::Clear => StartCheck::AlreadyRunning {
                        job_id: Uuid::nil(),
                    },
                    other => other,
                };
                Ok(StartOutcome::Blocked(blocked))
            }
            Err(err) => {
                txn.rollback().await?;
                Err(err)
            }
        }
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    /// Move a live job to its terminal state.
    ///
    /// Returns `false` when the job was already terminal (for instance failed by
    /// the stale watchdog); a terminal status is never overwritten.
    pub async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counters: JobCounters,
        error_details: Option<JsonValue>,
    ) -> Result<bool, DbErr> {
        let now = to_db_time(Utc::now());
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::IssuesProcessed, Expr::value(counters.processed as i32))
            .col_expr(Column::IssuesCreated, Expr::value(counters.created as i32))
            .col_expr(Column::IssuesUpdated, Expr::value(counters.updated as i32))
            .col_expr(Column::IssuesSkipped, Expr::value(counters.skipped as i32))
            .col_expr(Column::IssuesFailed, Expr::value(counters.failed as i32))
            .col_expr(Column::ErrorDetails, Expr::value(error_details))
            .col_expr(Column::CompletedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(active_filter())
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            tracing::warn!(job_id = %job_id, status = status.as_str(), "Job already terminal, result not recorded");
            return Ok(false);
        }
        Ok(true)
    }

    /// Live jobs whose start (or creation, if never started) predates `now - timeout`.
    pub async fn find_stale(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<Model>, DbErr> {
        let cutoff = to_db_time(now - timeout);
        Entity::find()
            .filter(active_filter())
            .filter(
                Condition::any()
                    .add(Column::StartedAt.lt(cutoff))
                    .add(
                        Condition::all()
                            .add(Column::StartedAt.is_null())
                            .add(Column::CreatedAt.lt(cutoff)),
                    ),
            )
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// Force a stale job to `failed` with a diagnostic. Returns whether it was still live.
    pub async fn fail_stale(&self, job: &Model, timeout: Duration) -> Result<bool, DbErr> {
        let details = serde_json::json!({
            "sync_status": "failed",
            "errors": [{
                "error": format!(
                    "job exceeded stale timeout of {} minutes and was marked failed by the scheduler",
                    timeout.num_minutes()
                ),
            }],
        });
        let counters = JobCounters {
            processed: job.issues_processed.max(0) as u32,
            created: job.issues_created.max(0) as u32,
            updated: job.issues_updated.max(0) as u32,
            skipped: job.issues_skipped.max(0) as u32,
            failed: job.issues_failed.max(0) as u32,
        };
        self.finish(job.id, JobStatus::Failed, counters, Some(details))
            .await
    }

    /// Whether the latest finished job of `config_id` stopped at the fetch cap.
    pub async fn last_pass_capped(&self, config_id: i32) -> Result<bool, DbErr> {
        let last = Entity::find()
            .filter(Column::ConfigId.eq(config_id))
            .filter(Column::CompletedAt.is_not_null())
            .order_by_desc(Column::CompletedAt)
            .one(&self.db)
            .await?;
        Ok(last
            .and_then(|job| job.error_details)
            .and_then(|details| details.get("capped").and_then(JsonValue::as_bool))
            .unwrap_or(false))
    }

    pub async fn list_for_config(&self, config_id: i32) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::ConfigId.eq(config_id))
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await
    }
}
