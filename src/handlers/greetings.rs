//! Greeting streams over HTTP.
//!
//! # Endpoints
//!
//! - `GET /sse/greetings/{name}` - Server-sent events, one JSON
//!   `GreetingResponse` per event
//! - `GET /ws/greetings` - WebSocket; every text frame sent by the client
//!   is a name, and the greetings for all names received so far are
//!   interleaved on the way back
//!
//! Both streams are unbounded. They stop when the client goes away or the
//! server shuts down.

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::SelectAll;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::AppResult;
use crate::models::{GreetingRequest, GreetingResponse};
use crate::services::{GreetingService, GreetingStream};
use crate::state::AppState;
use crate::validation::validate_greeting_name;

/// Greetings for `name` as server-sent events.
#[instrument(skip(state))]
pub async fn sse_greetings(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    validate_greeting_name(&name)?;

    let events = state
        .greetings
        .greet(GreetingRequest::new(name))
        .map(|greeting| Ok::<_, Infallible>(greeting_event(&greeting)))
        .take_until(state.shutdown_token().cancelled_owned());

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub(crate) fn greeting_event(greeting: &GreetingResponse) -> Event {
    // A struct of one String always serializes
    Event::default()
        .json_data(greeting)
        .unwrap_or_else(|_| Event::default().data(&greeting.message))
}

#[instrument(skip(state, ws))]
pub async fn ws_greetings(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let greetings = state.greetings.clone();
    let shutdown = state.shutdown_token();
    ws.on_upgrade(move |socket| greeting_socket(socket, greetings, shutdown))
}

async fn greeting_socket(
    socket: WebSocket,
    greetings: GreetingService,
    shutdown: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut streams: SelectAll<GreetingStream> = SelectAll::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let name = text.as_str().trim();
                    if let Err(e) = validate_greeting_name(name) {
                        warn!(error = %e, "Ignoring invalid greeting name");
                        continue;
                    }
                    debug!(name, "WebSocket greeting stream requested");
                    streams.push(greetings.greet(GreetingRequest::new(name)));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive failed");
                    break;
                }
            },
            Some(greeting) = streams.next(), if !streams.is_empty() => {
                if sender.send(Message::Text(greeting.message.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(streams = streams.len(), "WebSocket closed, dropping greeting streams");
}
