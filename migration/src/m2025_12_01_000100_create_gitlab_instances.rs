//! Creates the `gitlab_instances` and `instance_pairs` tables.
//!
//! Both are managed by the external CRUD surface; the sync core only reads them.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(GitlabInstances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(GitlabInstances::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(GitlabInstances::Name).text().not_null())
                    .col(
                        ColumnDef::new(GitlabInstances::Url)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(GitlabInstances::ApiToken).text().not_null())
                    .col(
                        ColumnDef::new(GitlabInstances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(GitlabInstances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InstancePairs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstancePairs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstancePairs::Name).text().not_null())
                    .col(
                        ColumnDef::new(InstancePairs::SourceInstanceId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InstancePairs::TargetInstanceId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InstancePairs::MirrorDirection)
                            .text()
                            .not_null()
                            .default("push"),
                    )
                    .col(
                        ColumnDef::new(InstancePairs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InstancePairs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_instance_pairs_source_instance_id")
                            .from(InstancePairs::Table, InstancePairs::SourceInstanceId)
                            .to(GitlabInstances::Table, GitlabInstances::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_instance_pairs_target_instance_id")
                            .from(InstancePairs::Table, InstancePairs::TargetInstanceId)
                            .to(GitlabInstances::Table, GitlabInstances::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InstancePairs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(GitlabInstances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum GitlabInstances {
    Table,
    Id,
    Name,
    Url,
    ApiToken,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
pub(crate) enum InstancePairs {
    Table,
    Id,
    Name,
    SourceInstanceId,
    TargetInstanceId,
    MirrorDirection,
    CreatedAt,
    UpdatedAt,
}
