//! Database migrations for the issue mirror service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000100_create_gitlab_instances;
mod m2025_12_01_000200_create_mirrors;
mod m2025_12_01_000300_create_issue_sync_jobs;
mod m2025_12_01_000400_add_issue_sync_job_active_guard;
mod m2025_12_01_000500_create_sync_mappings;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000100_create_gitlab_instances::Migration),
            Box::new(m2025_12_01_000200_create_mirrors::Migration),
            Box::new(m2025_12_01_000300_create_issue_sync_jobs::Migration),
            Box::new(m2025_12_01_000400_add_issue_sync_job_active_guard::Migration),
            Box::new(m2025_12_01_000500_create_sync_mappings::Migration),
        ]
    }
}
