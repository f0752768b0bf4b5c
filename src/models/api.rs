use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response of the reservation service.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
    /// Whether the RPC listener is accepting connections
    pub rpc_listening: bool,
}

/// Health check response of the edge.
#[derive(Debug, Serialize, Deserialize)]
pub struct EdgeHealthResponse {
    /// "healthy" or "degraded"
    pub status: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
    /// Whether the greetings RPC connection is up
    pub rpc_connected: bool,
    /// State of the reservation client circuit breaker
    pub circuit_breaker: String,
}

/// Statistics response.
///
/// `reservations_count` comes from a background-refreshed cache, the
/// remaining counters are live.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Number of stored reservations
    pub reservations_count: u64,
    /// Greeting streams currently open (SSE, WebSocket and RPC)
    pub greeting_streams_active: u64,
    /// Greetings produced since startup
    pub greetings_emitted: u64,
    /// Open RPC connections
    pub rpc_connections: u64,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Age of the cached reservation count in seconds
    pub cache_age_seconds: u64,
}
