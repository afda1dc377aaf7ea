//! Operational HTTP surface: liveness and reconciliation status

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::ReconcileResult;
use crate::indexer::{ReconciliationService, TickReport};
use crate::services::{AnalyticsService, PoolStats};
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub store: &'static str,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub last_tick: Option<TickReport>,
    pub pool: PoolStats,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(reconciliation_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, database) = match state.store.ping().await {
        Ok(()) => ("healthy", "connected".to_string()),
        Err(e) => ("unhealthy", format!("error: {}", e)),
    };

    Json(HealthResponse {
        status: status.to_string(),
        database,
        store: state.store.backend().label(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status - last tick and pool totals
async fn reconciliation_status(
    State(reconciler): State<Arc<ReconciliationService>>,
    State(analytics): State<Arc<AnalyticsService>>,
) -> ReconcileResult<Json<StatusResponse>> {
    let pool = analytics.pool_stats().await?;
    Ok(Json(StatusResponse {
        last_tick: reconciler.last_report().await,
        pool,
    }))
}
