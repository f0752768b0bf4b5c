//! The edge: greetings over RPC, reservation names with a fallback, and
//! the gateway in front of the reservation service.

use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reservation_demo::gateway::RouteDefinition;
use reservation_demo::services::run_startup_checks;
use reservation_demo::{Config, EdgeState, build_edge_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Reservation Edge v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        port = %config.edge_port,
        reservation_service = %config.reservation_service_url,
        greetings_rpc = %config.greetings_rpc_addr,
        "Configuration loaded"
    );

    metrics::try_init_metrics(config.edge_metrics_addr());

    let state = EdgeState::new(config.clone()).map_err(|e| {
        error!("Failed to build edge state: {e}");
        exitcode::CONFIG
    })?;
    for route in state.gateway.routes() {
        log_route(route);
    }

    let app = build_edge_router(state.clone());

    let addr: SocketAddr = config.edge_addr().parse().map_err(|e| {
        error!("Invalid edge address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    let checks = TaskTracker::new();
    if config.edge_startup_checks {
        checks.spawn(run_startup_checks(
            state.reservations.clone(),
            state.greetings.clone(),
            config.check_greeting_name.clone(),
            state.shutdown_token(),
        ));
    }
    checks.close();

    info!("Edge listening on http://{addr}");
    info!("  GET /health               - Health check");
    info!("  GET /ready                - Readiness check (RPC connected)");
    info!("  GET /greetings/{{name}}     - Greetings relayed over RPC");
    info!("  GET /reservations/names   - Reservation names");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal(state.shutdown_token()))
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;
    checks.wait().await;

    info!("Edge shutdown complete");
    Ok(())
}

fn log_route(route: &RouteDefinition) {
    info!(
        id = %route.id,
        path = %route.path,
        host = ?route.host,
        set_path = ?route.set_path,
        rate_limit = ?route.rate_limit,
        uri = %route.uri,
        "Gateway route"
    );
}
