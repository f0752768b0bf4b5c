//! Startup checks of the edge: exercise both upstream paths once and log
//! what comes back.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{GreetingsClient, ReservationClient};
use crate::models::GreetingRequest;

/// Log the reservation names, then log greetings for `name` until `shutdown`
/// fires or the stream ends.
pub async fn run_startup_checks(
    reservations: ReservationClient,
    greetings: GreetingsClient,
    name: String,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = shutdown.cancelled() => return,
        names = reservations.names() => info!(?names, "reservations"),
    }

    let mut stream = match greetings.greet(GreetingRequest::new(name)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Greeting check could not subscribe");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(greeting)) => info!("new greeting: {}", greeting.message),
                Some(Err(e)) => {
                    warn!(error = %e, "Greeting check stream failed");
                    break;
                }
                None => break,
            },
        }
    }

    info!("Greeting check stopped");
}
