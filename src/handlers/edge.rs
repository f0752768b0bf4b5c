//! Edge endpoints: greetings relayed from the RPC channel, reservation
//! names with a fallback, and the gateway for everything else.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Request, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::{Stream, StreamExt};
use tracing::{instrument, warn};

use super::greetings::greeting_event;
use crate::error::AppResult;
use crate::models::GreetingRequest;
use crate::state::EdgeState;
use crate::validation::validate_greeting_name;

/// Greetings for `name`, requested over RPC and relayed as server-sent
/// events. A failure upstream becomes a final `error` event.
#[instrument(skip(state))]
pub async fn edge_greetings(
    State(state): State<EdgeState>,
    Path(name): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    validate_greeting_name(&name)?;

    let upstream = state.greetings.greet(GreetingRequest::new(name)).await?;

    let events = upstream
        .map(|item| {
            Ok::<_, Infallible>(match item {
                Ok(greeting) => greeting_event(&greeting),
                Err(e) => {
                    warn!(error = %e, "Greeting stream failed upstream");
                    Event::default().event("error").data(e.to_string())
                }
            })
        })
        .take_until(state.shutdown_token().cancelled_owned());

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Names of all reservations, `["EEEK!"]` when the service is unavailable.
#[instrument(skip(state))]
pub async fn reservation_names(State(state): State<EdgeState>) -> Json<Vec<String>> {
    Json(state.reservations.names().await)
}

/// Fallback of the edge router: hand the request to the gateway.
pub async fn gateway(State(state): State<EdgeState>, req: Request) -> Response {
    state.gateway.handle(req).await
}
