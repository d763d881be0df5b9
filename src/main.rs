//! # Issue Mirror Entry Point
//!
//! `issue-mirror serve` (the default) migrates the database, then runs the HTTP
//! API and the issue sync scheduler. `issue-mirror migrate` only migrates.

use anyhow::Context;
use clap::{Parser, Subcommand};
use issue_mirror::{
    config::ConfigLoader,
    db,
    migration::{Migrator, MigratorTrait},
    server::run_server,
    telemetry,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "issue-mirror")]
#[command(version, about = "GitLab issue mirroring service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Apply migrations, then serve the API and run the scheduler
    Serve,
    /// Apply pending migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    Migrator::up(&db, None)
        .await
        .context("applying database migrations")?;
    info!("Database migrations applied");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => Ok(()),
        Command::Serve => run_server(config, db).await,
    }
}
