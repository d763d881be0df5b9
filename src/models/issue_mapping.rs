//! IssueMapping entity model
//!
//! Correlates a source issue with its mirrored copy. `sync_status` moves
//! `pending → synced` once the comment and attachment tail has finished, or
//! stays `partial` when it did not; the target issue is never rolled back.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "issue_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub config_id: i32,
    pub source_issue_id: i64,
    pub source_issue_iid: i64,
    pub target_issue_id: i64,
    pub target_issue_iid: i64,
    /// SHA-256 over title and description of the source issue
    pub source_content_hash: String,
    /// Source `opened`/`closed` state at the last successful write
    pub source_state: String,
    pub sync_status: String,
    pub last_synced_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::comment_mapping::Entity")]
    CommentMapping,
    #[sea_orm(has_many = "super::attachment_mapping::Entity")]
    AttachmentMapping,
}

impl Related<super::comment_mapping::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CommentMapping.def()
    }
}

impl Related<super::attachment_mapping::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AttachmentMapping.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStatus {
    Pending,
    Synced,
    Partial,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Synced => "synced",
            MappingStatus::Partial => "partial",
        }
    }
}

impl Model {
    /// A mapping whose tail never finished is retried even with an unchanged hash.
    pub fn needs_tail_retry(&self) -> bool {
        self.sync_status != MappingStatus::Synced.as_str()
    }
}
