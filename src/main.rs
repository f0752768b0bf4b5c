use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use reservation_demo::services::SampleDataInitializer;
use reservation_demo::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        "Starting Reservation Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the service, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        rpc_port = %config.rpc_port,
        greeting_interval_ms = config.greeting_interval.as_millis() as u64,
        "Configuration loaded"
    );

    metrics::try_init_metrics(config.metrics_addr());

    let state = AppState::new(config.clone());

    // Seed sample data
    if config.seed_sample_data {
        SampleDataInitializer::new(state.reservations.clone(), config.sample_reservations.clone())
            .run()
            .await
            .map_err(|e| {
                error!("Failed to seed sample reservations: {e}");
                exitcode::DATAERR
            })?;
        state.refresh_stats().await;
    }

    let app = build_router(state.clone());

    // Bind both listeners before serving anything
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    let rpc_addr = config.rpc_addr();
    let rpc_listener = TcpListener::bind(&rpc_addr).await.map_err(|e| {
        error!("Failed to bind RPC listener to {rpc_addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    let rpc_shutdown = state.shutdown_token();
    let rpc_task = tokio::spawn(state.rpc_server.clone().serve(rpc_listener, rpc_shutdown));

    info!("Server listening on http://{addr}");
    info!("RPC listening on tcp://{rpc_addr}");
    info!("API endpoints:");
    info!("  GET    /health                - Health check");
    info!("  GET    /ready                 - Readiness check");
    info!("  GET    /stats                 - Service statistics");
    info!("  GET    /reservations          - List reservations");
    info!("  POST   /reservations          - Create a reservation");
    info!("  POST   /reservations/batch    - Create reservations, all or nothing");
    info!("  GET    /reservations/{{id}}     - Get a reservation");
    info!("  DELETE /reservations/{{id}}     - Delete a reservation");
    info!("  GET    /sse/greetings/{{name}}  - Greetings as server-sent events");
    info!("  GET    /ws/greetings          - Greetings over WebSocket");

    // Start server with graceful shutdown
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

    // The RPC server shares the token and is already stopping
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;
    if let Err(e) = rpc_task.await {
        warn!("RPC server task failed: {e}");
    }

    info!("Server shutdown complete");
    Ok(())
}
