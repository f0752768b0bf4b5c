//! Responder side of the RPC channel.
//!
//! Each accepted connection gets a reader loop (this task) and a writer
//! task. Each requested stream runs in its own task that feeds frames to the
//! writer through a bounded channel, so a slow peer back-pressures producers
//! instead of buffering without limit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::frame::{CONNECTION_STREAM_ID, ErrorCode, Frame, pump_frames, read_frame};
use super::router::{MessageRouter, ResponseStream, RouteRequest};
use crate::config::Config;
use crate::metrics;
use crate::models::{Credentials, Principal};
use crate::services::UserStore;

/// Frames buffered per connection before stream tasks wait for the writer.
const OUTBOUND_BUFFER: usize = 64;

/// Serves a [`MessageRouter`] over TCP.
///
/// Cloning shares the counters, so a clone kept in application state sees
/// the live connection count.
#[derive(Clone)]
pub struct RpcServer {
    router: Arc<MessageRouter>,
    users: UserStore,
    auth_required: bool,
    max_frame_bytes: usize,
    connections: Arc<AtomicU64>,
    listening: Arc<AtomicBool>,
}

impl RpcServer {
    pub fn new(router: MessageRouter, users: UserStore, config: &Config) -> Self {
        Self {
            router: Arc::new(router),
            users,
            auth_required: config.rpc_auth_required,
            max_frame_bytes: config.rpc_max_frame_bytes,
            connections: Arc::new(AtomicU64::new(0)),
            listening: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open RPC connections.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Whether the accept loop is running.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// connection to wind down.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        let connections = TaskTracker::new();
        self.listening.store(true, Ordering::SeqCst);

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "RPC server listening");
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("RPC server received cancellation signal");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let cancel = shutdown.child_token();
                        connections.spawn(async move {
                            server.handle_connection(stream, peer, cancel).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
                },
            }
        }

        self.listening.store(false, Ordering::SeqCst);
        connections.close();
        connections.wait().await;
        info!("RPC server stopped");
    }

    #[instrument(skip(self, stream, cancel), fields(%peer))]
    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        metrics::adjust_rpc_connections(1.0);
        debug!("RPC connection opened");

        let (mut reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(pump_frames(writer, outbound_rx, cancel.clone()));

        let mut connection = Connection {
            server: &self,
            outbound,
            cancel: cancel.clone(),
            streams: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            setup_principal: None,
            requested: false,
        };

        loop {
            let frame = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                frame = read_frame(&mut reader, self.max_frame_bytes) => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    if !connection.on_frame(frame).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("RPC peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Closing RPC connection after read failure");
                    connection
                        .send(Frame::error(CONNECTION_STREAM_ID, ErrorCode::Protocol, e.to_string()))
                        .await;
                    break;
                }
            }
        }

        // Stop every stream of this connection, then let the writer drain.
        let Connection {
            outbound, tasks, ..
        } = connection;
        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        drop(outbound);
        let _ = writer_task.await;

        self.connections.fetch_sub(1, Ordering::Relaxed);
        metrics::adjust_rpc_connections(-1.0);
        debug!("RPC connection closed");
    }
}

/// Per-connection state owned by the reader loop.
struct Connection<'a> {
    server: &'a RpcServer,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    /// Running streams by id; tasks remove themselves when they finish
    streams: Arc<Mutex<HashMap<u32, CancellationToken>>>,
    tasks: TaskTracker,
    setup_principal: Option<Principal>,
    requested: bool,
}

impl Connection<'_> {
    async fn send(&self, frame: Frame) {
        // Fails only when the writer is gone, which also ends the read loop
        let _ = self.outbound.send(frame).await;
    }

    /// Handle one inbound frame. Returns `false` to close the connection.
    async fn on_frame(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Setup { metadata } => self.on_setup(metadata).await,
            Frame::RequestStream {
                stream_id,
                route,
                metadata,
                data,
            } => {
                self.on_request(stream_id, route, metadata, data, false).await;
                true
            }
            Frame::RequestResponse {
                stream_id,
                route,
                metadata,
                data,
            } => {
                self.on_request(stream_id, route, metadata, data, true).await;
                true
            }
            Frame::Cancel { stream_id } => {
                if let Some(token) = self.streams.lock().await.remove(&stream_id) {
                    debug!(stream_id, "Stream cancelled by requester");
                    token.cancel();
                }
                true
            }
            other => {
                debug!(frame = ?other, "Ignoring unexpected frame from requester");
                true
            }
        }
    }

    async fn on_setup(&mut self, metadata: Option<Credentials>) -> bool {
        if self.requested {
            self.send(Frame::error(
                CONNECTION_STREAM_ID,
                ErrorCode::Protocol,
                "SETUP must precede all requests",
            ))
            .await;
            return false;
        }

        let Some(credentials) = metadata else {
            return true;
        };

        match self.server.users.authenticate(&credentials) {
            Some(principal) => {
                debug!(user = %principal.username, "RPC connection authenticated");
                self.setup_principal = Some(principal);
                true
            }
            None => {
                warn!(user = %credentials.username, "Rejected RPC setup credentials");
                metrics::record_auth_failure("rpc");
                self.send(Frame::error(
                    CONNECTION_STREAM_ID,
                    ErrorCode::Rejected,
                    "invalid credentials",
                ))
                .await;
                false
            }
        }
    }

    async fn on_request(
        &mut self,
        stream_id: u32,
        route: String,
        metadata: Option<Credentials>,
        data: Value,
        single: bool,
    ) {
        self.requested = true;

        if stream_id == CONNECTION_STREAM_ID || self.streams.lock().await.contains_key(&stream_id)
        {
            self.send(Frame::error(
                stream_id,
                ErrorCode::Protocol,
                format!("stream id {stream_id} is reserved or in use"),
            ))
            .await;
            return;
        }

        // Request metadata wins over setup metadata
        let principal = match metadata {
            Some(credentials) => match self.server.users.authenticate(&credentials) {
                Some(principal) => Some(principal),
                None => {
                    metrics::record_auth_failure("rpc");
                    metrics::record_rpc_request(&route, "rejected");
                    self.send(Frame::error(stream_id, ErrorCode::Rejected, "invalid credentials"))
                        .await;
                    return;
                }
            },
            None => self.setup_principal.clone(),
        };

        if self.server.auth_required && principal.is_none() {
            metrics::record_rpc_request(&route, "rejected");
            self.send(Frame::error(
                stream_id,
                ErrorCode::Rejected,
                "authentication required",
            ))
            .await;
            return;
        }

        let responses = match self
            .server
            .router
            .dispatch(&route, RouteRequest { data, principal })
        {
            Ok(responses) => responses,
            Err((code, message)) => {
                debug!(stream_id, %route, %code, %message, "RPC request refused");
                metrics::record_rpc_request(&route, "refused");
                self.send(Frame::error(stream_id, code, message)).await;
                return;
            }
        };

        let token = self.cancel.child_token();
        self.streams.lock().await.insert(stream_id, token.clone());

        let responses = if single {
            responses.take(1).boxed()
        } else {
            responses
        };
        self.tasks.spawn(run_stream(
            stream_id,
            route,
            responses,
            self.outbound.clone(),
            token,
            self.streams.clone(),
        ));
    }
}

/// Forward one response stream to the requester.
async fn run_stream(
    stream_id: u32,
    route: String,
    mut responses: ResponseStream,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    streams: Arc<Mutex<HashMap<u32, CancellationToken>>>,
) {
    debug!(stream_id, %route, "Stream started");

    let outcome = loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => break "cancelled",
            next = responses.next() => next,
        };

        let (frame, outcome) = match next {
            Some(Ok(data)) => (Frame::Next { stream_id, data }, None),
            Some(Err(e)) => (
                Frame::error(stream_id, ErrorCode::ApplicationError, e.to_string()),
                Some("error"),
            ),
            None => (Frame::Complete { stream_id }, Some("completed")),
        };

        if outbound.send(frame).await.is_err() {
            break "disconnected";
        }
        if let Some(outcome) = outcome {
            break outcome;
        }
    };

    streams.lock().await.remove(&stream_id);
    metrics::record_rpc_request(&route, outcome);
    debug!(stream_id, %route, outcome, "Stream finished");
}
