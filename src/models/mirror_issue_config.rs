//! MirrorIssueConfig entity model
//!
//! The issue-sync policy attached to a mirror: feature toggles, the scheduling
//! cursor and the outcome of the last run. Toggles belong to the management
//! surface; the cursor and status columns are written only by sync runs.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "mirror_issue_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub mirror_id: i32,
    pub enabled: bool,
    pub sync_comments: bool,
    pub sync_labels: bool,
    pub sync_attachments: bool,
    pub sync_weight: bool,
    pub sync_time_estimate: bool,
    pub sync_time_spent: bool,
    pub sync_closed_issues: bool,
    /// Whether previously mirrored issues are updated when the source changes
    pub update_existing: bool,
    /// Whether the first run sweeps issues that existed before the config
    pub sync_existing_issues: bool,
    pub sync_interval_minutes: i32,
    pub last_sync_at: Option<DateTimeWithTimeZone>,
    pub next_sync_at: Option<DateTimeWithTimeZone>,
    /// One of [`SyncStatus`]
    pub last_sync_status: Option<String>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::mirror::Entity",
        from = "Column::MirrorId",
        to = "super::mirror::Column::Id"
    )]
    Mirror,
}

impl Related<super::mirror::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Mirror.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Outcome of a whole sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    /// Rolls per-issue results up into a run status.
    ///
    /// `degraded` counts issues that were written but whose comment or
    /// attachment tail did not finish.
    pub fn rollup(succeeded: u32, degraded: u32, failed: u32) -> Self {
        if failed == 0 && degraded == 0 {
            SyncStatus::Success
        } else if succeeded == 0 && degraded == 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Partial
        }
    }
}
