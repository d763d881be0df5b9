//! # Server Configuration
//!
//! Router, shared state and process wiring: the HTTP server and the issue sync
//! scheduler run side by side and stop together on Ctrl-C.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::gitlab::HttpGitLabClientFactory;
use crate::handlers;
use crate::resilience::CircuitBreakerRegistry;
use crate::scheduler::IssueSyncScheduler;
use crate::sync::{HttpAttachmentFetcher, SyncRunner};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub runner: Arc<SyncRunner>,
}

/// Build the production runner: reqwest clients and the SSRF-checked fetcher.
pub fn build_runner(config: Arc<AppConfig>, db: DatabaseConnection) -> Arc<SyncRunner> {
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
    let factory = Arc::new(HttpGitLabClientFactory::new(config.http_request_timeout()));
    let fetcher = Arc::new(HttpAttachmentFetcher::new(config.attachments.clone()));
    Arc::new(SyncRunner::new(db, config, breakers, factory, fetcher))
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/configs/{config_id}/sync", post(handlers::sync::trigger_sync))
        .route("/configs/{config_id}/jobs", get(handlers::sync::list_config_jobs))
        .route("/jobs/{job_id}", get(handlers::sync::get_job))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

/// Serve HTTP and run the scheduler until Ctrl-C, then drain both.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let runner = build_runner(config.clone(), db.clone());
    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        runner: runner.clone(),
    };
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let shutdown = CancellationToken::new();
    let scheduler = IssueSyncScheduler::new(config.clone(), db, runner);
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move {
        if let Err(err) = scheduler.run(scheduler_shutdown).await {
            error!(error = ?err, "Issue sync scheduler exited with error");
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    let signal_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            signal_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(err) = scheduler_task.await {
        error!(error = %err, "Scheduler task panicked");
    }
    info!("Server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::sync::trigger_sync,
        crate::handlers::sync::get_job,
        crate::handlers::sync::list_config_jobs,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::CircuitInfo,
            crate::handlers::sync::TriggerSyncResponse,
            crate::handlers::sync::JobInfo,
        )
    ),
    tags(
        (name = "root", description = "Service info and health"),
        (name = "sync", description = "Issue sync triggers and job status")
    ),
    info(
        title = "Issue Mirror API",
        description = "Trigger and inspect GitLab issue mirroring jobs",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
