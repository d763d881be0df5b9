//! CommentMapping entity: correlates a source note with its mirrored note.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "comment_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub issue_mapping_id: Uuid,
    pub source_note_id: i64,
    pub target_note_id: i64,
    pub source_content_hash: String,
    pub last_synced_at: DateTimeWithTimeZone,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::issue_mapping::Entity",
        from = "Column::IssueMappingId",
        to = "super::issue_mapping::Column::Id"
    )]
    IssueMapping,
}

impl Related<super::issue_mapping::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IssueMapping.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
