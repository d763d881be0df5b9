//! IssueSyncJob entity model
//!
//! One row per sync attempt. The state machine is `pending → running →
//! {completed, failed}`; terminal rows are never mutated again. The four
//! project/instance columns are copied from the mirror at creation time so
//! conflict detection does not need to join through configs.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "issue_sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub config_id: i32,

    /// `manual` or `scheduled`
    pub job_type: String,

    /// One of [`JobStatus`]
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

    /// Structured failure context: run status plus per-issue errors
    #[sea_orm(column_type = "JsonBinary")]
    pub error_details: Option<JsonValue>,

    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::mirror_issue_config::Entity",
        from = "Column::ConfigId",
        to = "super::mirror_issue_config::Column::Id"
    )]
    MirrorIssueConfig,
}

impl Related<super::mirror_issue_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MirrorIssueConfig.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Statuses that still hold the per-config and bidirectional locks.
    pub const ACTIVE: [&'static str; 2] = ["pending", "running"];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Manual,
    Scheduled,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Manual => "manual",
            JobType::Scheduled => "scheduled",
        }
    }
}

/// The `(source project, target project, source instance, target instance)`
/// tuple conflict detection compares.
///
/// Project ids are only unique within one GitLab instance, so the instance ids
/// are part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConflictKeys {
    pub source_project_id: i64,
    pub target_project_id: i64,
    pub source_instance_id: i32,
    pub target_instance_id: i32,
}

impl ConflictKeys {
    /// The keys a job replicating in the opposite direction would carry.
    pub fn reversed(&self) -> Self {
        Self {
            source_project_id: self.target_project_id,
            target_project_id: self.source_project_id,
            source_instance_id: self.target_instance_id,
            target_instance_id: self.source_instance_id,
        }
    }
}

impl Model {
    pub fn conflict_keys(&self) -> ConflictKeys {
        ConflictKeys {
            source_project_id: self.source_project_id,
            target_project_id: self.target_project_id,
            source_instance_id: self.source_instance_id,
            target_instance_id: self.target_instance_id,
        }
    }
}
