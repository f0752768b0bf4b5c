//! Health, readiness, and statistics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with RPC listener status
//! - `GET /ready` - Readiness check
//! - `GET /stats` - Service statistics (reservation count from a background cache)
//!
//! The edge has its own `/health` and `/ready`, reporting the RPC requester
//! and circuit breaker instead.
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 if not ready to serve traffic

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::{EdgeHealthResponse, HealthResponse, StatsResponse};
use crate::state::{AppState, EdgeState};

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z",
///   "rpc_listening": true
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let rpc_listening = state.rpc_server.is_listening();

    Json(HealthResponse {
        status: if rpc_listening { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        rpc_listening,
    })
}

/// The service answers from memory, so it is ready once it is serving HTTP.
#[instrument]
pub async fn readiness_check() -> StatusCode {
    StatusCode::OK
}

/// Statistics endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "reservations_count": 8,
///   "greeting_streams_active": 1,
///   "greetings_emitted": 42,
///   "rpc_connections": 1,
///   "uptime_seconds": 3600,
///   "cache_age_seconds": 2
/// }
/// ```
#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let cached = state.cached_stats().await;

    // Never updated = infinitely old
    let cache_age_seconds = cached
        .last_updated
        .map(|t| t.elapsed().as_secs())
        .unwrap_or(u64::MAX);

    Json(StatsResponse {
        reservations_count: cached.reservations_count,
        greeting_streams_active: state.greetings.active_streams(),
        greetings_emitted: state.greetings.greetings_emitted(),
        rpc_connections: state.rpc_server.connections(),
        uptime_seconds: state.uptime_seconds(),
        cache_age_seconds,
    })
}

#[instrument(skip(state))]
pub async fn edge_health_check(State(state): State<EdgeState>) -> Json<EdgeHealthResponse> {
    let rpc_connected = state.greetings.requester().is_connected();
    let circuit = state.breaker.state().await;

    Json(EdgeHealthResponse {
        status: if rpc_connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        rpc_connected,
        circuit_breaker: circuit.to_string(),
    })
}

/// Ready once the greetings RPC connection is up.
#[instrument(skip(state))]
pub async fn edge_readiness_check(
    State(state): State<EdgeState>,
) -> Result<StatusCode, StatusCode> {
    if state.greetings.requester().is_connected() {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
