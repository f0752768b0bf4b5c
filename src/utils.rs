use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Wait for Ctrl+C, SIGTERM, or `cancel`, then cancel `cancel`.
///
/// Servers sharing the token stop together whichever way shutdown starts.
/// A signal handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
        _ = cancel.cancelled() => {
            warn!("Shutdown requested, initiating graceful shutdown...");
        }
    }

    cancel.cancel();
}
