//! # API Handlers
//!
//! HTTP endpoints for service info, health, and issue sync jobs.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db;
use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod sync;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Health probe response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    /// Circuit breaker state per GitLab instance seen so far
    pub circuits: Vec<CircuitInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitInfo {
    #[schema(example = "https://gitlab.example.com")]
    pub instance: String,
    #[schema(example = "CLOSED")]
    pub state: String,
}

/// Database health check plus circuit breaker snapshot
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Database unavailable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    db::health_check(&state.db).await.map_err(|err| {
        tracing::warn!(error = ?err, "Health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database service unavailable",
        )
    })?;

    let circuits = state
        .runner
        .breakers()
        .snapshot()
        .into_iter()
        .map(|(instance, circuit)| CircuitInfo {
            instance,
            state: circuit.as_str().to_string(),
        })
        .collect();

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        circuits,
    }))
}
