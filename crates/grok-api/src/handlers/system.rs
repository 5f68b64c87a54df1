//! Health and stats

use axum::{extract::State, Json};
use sea_orm::{ConnectionTrait, Statement};
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::{HealthResponse, PoolStatsInfo, StatsResponse};
use crate::AppState;

/// Liveness plus a database ping.
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "system",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database = match state
        .db
        .execute(Statement::from_string(
            state.db.get_database_backend(),
            "SELECT 1".to_string(),
        ))
        .await
    {
        Ok(_) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        database,
    })
}

/// Live counters: tunnels, pool, SSE clients, drop counters.
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "system",
    responses((status = 200, description = "Runtime stats", body = StatsResponse))
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let pool = state.service.pool().stats();
    Ok(Json(StatsResponse {
        active_tunnels: state.service.registry().count(),
        pool: PoolStatsInfo {
            start: pool.start,
            end: pool.end,
            total: pool.total,
            allocated: pool.allocated,
            available: pool.available,
            utilization: pool.utilization,
        },
        sse_clients: state.broker.client_count(),
        events_dropped: state.events.dropped_count() + state.broker.dropped_count(),
        log_records_dropped: state.log.dropped_count(),
    }))
}
