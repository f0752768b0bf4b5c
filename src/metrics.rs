//! Prometheus metrics for application observability.
//!
//! Both binaries expose metrics on their own listener (service: `METRICS_PORT`,
//! edge: `EDGE_METRICS_PORT`, 0 disables). Recording functions are safe to
//! call when no exporter is installed; the values are simply dropped.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `reservation_greetings_emitted_total` - Greetings produced by the greeting service
//! - `reservation_saved_total` - Reservations stored (label: source)
//! - `reservation_rpc_requests_total` - RPC requests (labels: route, outcome)
//! - `reservation_rpc_reconnects_total` - Requester reconnection attempts
//! - `reservation_upstream_retries_total` - Retried upstream calls
//! - `reservation_upstream_fallbacks_total` - Calls answered by the fallback value
//! - `reservation_circuit_breaker_opens_total` - Times the circuit breaker opened
//! - `reservation_circuit_breaker_rejections_total` - Requests rejected by circuit breaker
//! - `reservation_gateway_requests_total` - Proxied requests (labels: route, status)
//! - `reservation_rate_limited_total` - Requests rejected by a rate limiter (label: limiter)
//! - `reservation_auth_failures_total` - Failed authentication attempts (label: channel)
//!
//! ## Histograms
//! - `reservation_proxy_duration_seconds` - Upstream round trip of proxied requests (label: route)
//!
//! ## Gauges
//! - `reservation_greeting_streams_active` - Open greeting streams
//! - `reservation_rpc_connections_active` - Open server-side RPC connections
//! - `reservation_rpc_connection_status` - Edge requester status (1 = connected, 0 = disconnected)
//! - `reservation_circuit_breaker_state` - Circuit breaker state (0 = closed, 1 = half-open, 2 = open)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const GREETINGS_EMITTED_TOTAL: &str = "reservation_greetings_emitted_total";
    pub const RESERVATIONS_SAVED_TOTAL: &str = "reservation_saved_total";
    pub const RPC_REQUESTS_TOTAL: &str = "reservation_rpc_requests_total";
    pub const RPC_RECONNECTS_TOTAL: &str = "reservation_rpc_reconnects_total";
    pub const UPSTREAM_RETRIES_TOTAL: &str = "reservation_upstream_retries_total";
    pub const UPSTREAM_FALLBACKS_TOTAL: &str = "reservation_upstream_fallbacks_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "reservation_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str =
        "reservation_circuit_breaker_rejections_total";
    pub const GATEWAY_REQUESTS_TOTAL: &str = "reservation_gateway_requests_total";
    pub const RATE_LIMITED_TOTAL: &str = "reservation_rate_limited_total";
    pub const AUTH_FAILURES_TOTAL: &str = "reservation_auth_failures_total";
    pub const PROXY_DURATION_SECONDS: &str = "reservation_proxy_duration_seconds";
    pub const GREETING_STREAMS_ACTIVE: &str = "reservation_greeting_streams_active";
    pub const RPC_CONNECTIONS_ACTIVE: &str = "reservation_rpc_connections_active";
    pub const RPC_CONNECTION_STATUS: &str = "reservation_rpc_connection_status";
    pub const CIRCUIT_BREAKER_STATE: &str = "reservation_circuit_breaker_state";
}

/// Initialize the Prometheus metrics exporter.
///
/// This sets up metric descriptions and starts the Prometheus HTTP listener
/// on the specified address.
///
/// # Returns
///
/// `Ok(())` if initialization succeeds, `Err` with message otherwise.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::GREETINGS_EMITTED_TOTAL,
        "Total number of greetings produced"
    );
    describe_counter!(
        names::RESERVATIONS_SAVED_TOTAL,
        "Total number of reservations stored"
    );
    describe_counter!(names::RPC_REQUESTS_TOTAL, "Total number of RPC requests");
    describe_counter!(
        names::RPC_RECONNECTS_TOTAL,
        "Total number of RPC reconnection attempts"
    );
    describe_counter!(
        names::UPSTREAM_RETRIES_TOTAL,
        "Total number of retried upstream calls"
    );
    describe_counter!(
        names::UPSTREAM_FALLBACKS_TOTAL,
        "Total number of upstream calls answered with a fallback"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times the circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of requests rejected by circuit breaker"
    );
    describe_counter!(
        names::GATEWAY_REQUESTS_TOTAL,
        "Total number of requests proxied by the gateway"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by a rate limiter"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of failed authentication attempts"
    );

    describe_histogram!(
        names::PROXY_DURATION_SECONDS,
        "Upstream round trip of proxied requests in seconds"
    );

    describe_gauge!(
        names::GREETING_STREAMS_ACTIVE,
        "Number of open greeting streams"
    );
    describe_gauge!(
        names::RPC_CONNECTIONS_ACTIVE,
        "Number of open server-side RPC connections"
    );
    describe_gauge!(
        names::RPC_CONNECTION_STATUS,
        "Edge RPC connection status (1 = connected, 0 = disconnected)"
    );
    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: Option<SocketAddr>) {
    let Some(addr) = metrics_addr else {
        info!("Metrics endpoint disabled");
        return;
    };

    if let Err(e) = init_metrics(addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record one emitted greeting.
pub fn record_greeting_emitted() {
    counter!(names::GREETINGS_EMITTED_TOTAL).increment(1);
}

/// Record stored reservations.
pub fn record_reservations_saved(source: &'static str, count: u64) {
    counter!(names::RESERVATIONS_SAVED_TOTAL, "source" => source).increment(count);
}

/// Record an RPC request and how it ended.
pub fn record_rpc_request(route: &str, outcome: &'static str) {
    counter!(names::RPC_REQUESTS_TOTAL, "route" => route.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!(names::RPC_RECONNECTS_TOTAL).increment(1);
}

/// Record a retried upstream call.
pub fn record_upstream_retry(operation: &'static str) {
    counter!(names::UPSTREAM_RETRIES_TOTAL, "operation" => operation).increment(1);
}

/// Record an upstream call answered by its fallback value.
pub fn record_upstream_fallback(operation: &'static str) {
    counter!(names::UPSTREAM_FALLBACKS_TOTAL, "operation" => operation).increment(1);
}

/// Record circuit breaker opening.
pub fn record_circuit_breaker_open() {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL).increment(1);
}

/// Record circuit breaker rejection.
pub fn record_circuit_breaker_rejection() {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
}

/// Record a request handled by a gateway route.
pub fn record_gateway_request(route: &str, status: u16) {
    counter!(names::GATEWAY_REQUESTS_TOTAL, "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a request rejected by a rate limiter (`global` or a route id).
pub fn record_rate_limited(limiter: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "limiter" => limiter.to_string()).increment(1);
}

/// Record a failed authentication attempt (`http` or `rpc`).
pub fn record_auth_failure(channel: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "channel" => channel).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record the upstream round trip of a proxied request.
pub fn record_proxy_duration(route: &str, duration_secs: f64) {
    histogram!(names::PROXY_DURATION_SECONDS, "route" => route.to_string()).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Track greeting stream open (+1) / close (-1).
pub fn adjust_greeting_streams(delta: f64) {
    gauge!(names::GREETING_STREAMS_ACTIVE).increment(delta);
}

/// Track RPC connection open (+1) / close (-1).
pub fn adjust_rpc_connections(delta: f64) {
    gauge!(names::RPC_CONNECTIONS_ACTIVE).increment(delta);
}

/// Update the edge RPC connection status gauge.
pub fn set_rpc_connection_status(connected: bool) {
    gauge!(names::RPC_CONNECTION_STATUS).set(if connected { 1.0 } else { 0.0 });
}

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(state: u8) {
    gauge!(names::CIRCUIT_BREAKER_STATE).set(f64::from(state));
}
