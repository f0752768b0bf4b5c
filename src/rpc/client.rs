//! Requester side of the RPC channel.
//!
//! # Connection Resilience
//!
//! The requester connects lazily and reconnects on demand: when a request
//! finds the connection gone, one task re-establishes it with exponential
//! backoff while concurrent requests wait for the outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! let requester = RpcRequester::new("localhost:7000", None, RequesterOptions::default());
//!
//! let mut greetings = requester
//!     .route("greetings")
//!     .data(&GreetingRequest::new("Jane"))
//!     .retrieve_stream::<GreetingResponse>()
//!     .await?;
//!
//! while let Some(greeting) = greetings.next().await {
//!     println!("{}", greeting?.message);
//! }
//! // Dropping `greetings` early cancels the stream on the server.
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{RwLock, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::connection::{ConnectionState, ReconnectGuard};
use super::frame::{CONNECTION_STREAM_ID, ErrorCode, Frame, pump_frames, read_frame};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::Credentials;
use crate::resilience::RetryPolicy;

/// Frames buffered towards the server.
const OUTBOUND_BUFFER: usize = 64;

/// Frames buffered per response stream.
const STREAM_BUFFER: usize = 32;

/// Tunables of a requester.
#[derive(Debug, Clone)]
pub struct RequesterOptions {
    pub max_frame_bytes: usize,
    /// Maximum reconnection attempts per outage (0 = infinite)
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for RequesterOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for RequesterOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_frame_bytes: config.rpc_max_frame_bytes,
            max_reconnect_attempts: config.rpc_reconnect_max_attempts,
            reconnect_base_delay: config.rpc_reconnect_base_delay,
            reconnect_max_delay: config.rpc_reconnect_max_delay,
        }
    }
}

/// Response streams of one connection, and how the connection ended.
#[derive(Default)]
struct Pending {
    streams: HashMap<u32, mpsc::Sender<Frame>>,
    /// Connection-level error the server sent before closing
    refused: Option<(ErrorCode, String)>,
    ended: bool,
}

type PendingStreams = Arc<Mutex<Pending>>;

fn lock_pending(pending: &PendingStreams) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live TCP connection.
struct Connection {
    outbound: mpsc::Sender<Frame>,
    pending: PendingStreams,
    closed: CancellationToken,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct Inner {
    addr: String,
    setup: Option<Credentials>,
    options: RequesterOptions,
    connection: RwLock<Option<Arc<Connection>>>,
    state: Arc<ConnectionState>,
    next_stream_id: AtomicU32,
}

/// Client for the RPC channel. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RpcRequester {
    inner: Arc<Inner>,
}

impl RpcRequester {
    /// Create a requester without connecting yet.
    ///
    /// `setup` credentials are sent once per connection and apply to every
    /// request that does not carry its own.
    pub fn new(
        addr: impl Into<String>,
        setup: Option<Credentials>,
        options: RequesterOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr: addr.into(),
                setup,
                options,
                connection: RwLock::new(None),
                state: Arc::new(ConnectionState::new()),
                next_stream_id: AtomicU32::new(1),
            }),
        }
    }

    /// Create a requester and connect right away.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionFailed` if the server is unreachable.
    pub async fn connect(
        addr: impl Into<String>,
        setup: Option<Credentials>,
        options: RequesterOptions,
    ) -> AppResult<Self> {
        let requester = Self::new(addr, setup, options);
        requester.establish().await?;
        Ok(requester)
    }

    /// Server address this requester talks to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.state.is_reconnecting()
    }

    /// Make sure a connection exists, reconnecting if needed.
    pub async fn ensure_connected(&self) -> AppResult<()> {
        self.connection().await.map(|_| ())
    }

    /// Close the current connection. Open response streams end with an error.
    pub async fn close(&self) {
        if let Some(connection) = self.inner.connection.write().await.take() {
            connection.closed.cancel();
            info!(addr = %self.inner.addr, "RPC connection closed");
        }
    }

    /// Start building a request for `route`.
    pub fn route(&self, route: impl Into<String>) -> RequestSpec {
        RequestSpec {
            requester: self.clone(),
            route: route.into(),
            metadata: None,
            data: Ok(Value::Null),
        }
    }

    async fn current(&self) -> Option<Arc<Connection>> {
        let guard = self.inner.connection.read().await;
        guard.as_ref().filter(|c| c.is_open()).cloned()
    }

    async fn connection(&self) -> AppResult<Arc<Connection>> {
        match self.current().await {
            Some(connection) => Ok(connection),
            None => self.reconnect().await,
        }
    }

    /// Open a connection and make it the current one.
    async fn establish(&self) -> AppResult<Arc<Connection>> {
        let addr = &self.inner.addr;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let closed = CancellationToken::new();
        let pending: PendingStreams = Arc::new(Mutex::new(Pending::default()));

        // Queued ahead of any request
        outbound
            .send(Frame::Setup {
                metadata: self.inner.setup.clone(),
            })
            .await
            .map_err(|_| AppError::Internal("RPC writer unavailable".to_string()))?;

        tokio::spawn(pump_frames(writer, outbound_rx, closed.clone()));
        let generation = self.inner.state.mark_connected();
        tokio::spawn(read_loop(
            reader,
            self.inner.options.max_frame_bytes,
            pending.clone(),
            closed.clone(),
            self.inner.state.clone(),
            generation,
        ));

        let connection = Arc::new(Connection {
            outbound,
            pending,
            closed,
        });
        *self.inner.connection.write().await = Some(connection.clone());

        info!(%addr, generation, "RPC connection established");
        Ok(connection)
    }

    /// Re-establish the connection with exponential backoff.
    ///
    /// If several tasks get here at once, only one reconnects; the others
    /// wait for it and share the result.
    #[instrument(skip(self), fields(addr = %self.inner.addr))]
    async fn reconnect(&self) -> AppResult<Arc<Connection>> {
        let state = &self.inner.state;

        if !state.start_reconnecting() {
            debug!("Reconnection already in progress, waiting for completion...");
            state.wait_for_reconnection().await;

            return self.current().await.ok_or_else(|| {
                AppError::ConnectionFailed(
                    "Reconnection failed (attempted by another task)".to_string(),
                )
            });
        }

        let _guard = ReconnectGuard(state);
        state.reset_attempts();

        let options = &self.inner.options;
        let backoff = RetryPolicy::new(
            options.max_reconnect_attempts,
            options.reconnect_base_delay,
            options.reconnect_max_delay,
        );
        let max_attempts = options.max_reconnect_attempts;

        loop {
            let attempt = state.increment_attempts();

            if max_attempts > 0 && attempt > max_attempts {
                error!(
                    attempts = attempt - 1,
                    max_attempts, "Maximum reconnection attempts exceeded"
                );
                return Err(AppError::ConnectionFailed(format!(
                    "Failed to connect to {} after {max_attempts} attempts",
                    self.inner.addr
                )));
            }

            // The first attempt goes out immediately
            if attempt > 1 {
                let delay = backoff.delay_for(attempt - 1);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Attempting to reconnect to RPC server"
                );
                sleep(delay).await;
            }

            metrics::record_reconnect_attempt();
            match self.establish().await {
                Ok(connection) => return Ok(connection),
                Err(e) => warn!(attempt, error = %e, "Connection attempt failed"),
            }
        }
    }

    /// Register a response stream and send the request frame.
    ///
    /// A request that cannot even be queued (connection died in between)
    /// is retried once on a fresh connection.
    async fn start<T>(
        &self,
        route: String,
        metadata: Option<Credentials>,
        data: Value,
        single: bool,
    ) -> AppResult<RpcStream<T>> {
        let mut retried = false;

        loop {
            let connection = self.connection().await?;
            let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            {
                let mut pending = lock_pending(&connection.pending);
                if let Some((code, message)) = &pending.refused {
                    return Err(AppError::Remote {
                        code: code.as_str().to_string(),
                        message: message.clone(),
                    });
                }
                if pending.ended {
                    drop(pending);
                    connection.closed.cancel();
                    if retried {
                        return Err(AppError::Disconnected(
                            "connection lost while sending request".to_string(),
                        ));
                    }
                    retried = true;
                    continue;
                }
                pending.streams.insert(stream_id, tx);
            }

            let frame = if single {
                Frame::RequestResponse {
                    stream_id,
                    route: route.clone(),
                    metadata: metadata.clone(),
                    data: data.clone(),
                }
            } else {
                Frame::RequestStream {
                    stream_id,
                    route: route.clone(),
                    metadata: metadata.clone(),
                    data: data.clone(),
                }
            };

            match connection.outbound.send(frame).await {
                Ok(()) => {
                    debug!(stream_id, %route, "RPC request sent");
                    return Ok(RpcStream {
                        stream_id,
                        frames: rx,
                        outbound: connection.outbound.clone(),
                        pending: connection.pending.clone(),
                        done: false,
                        _marker: PhantomData,
                    });
                }
                Err(_) => {
                    lock_pending(&connection.pending).streams.remove(&stream_id);
                    connection.closed.cancel();
                    if retried {
                        return Err(AppError::Disconnected(
                            "connection lost while sending request".to_string(),
                        ));
                    }
                    warn!(%route, "Connection lost while sending request, retrying once");
                    retried = true;
                }
            }
        }
    }
}

/// Reads frames and hands them to the response stream they belong to.
async fn read_loop(
    mut reader: OwnedReadHalf,
    max_frame_bytes: usize,
    pending: PendingStreams,
    closed: CancellationToken,
    state: Arc<ConnectionState>,
    generation: u64,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
        };

        match frame {
            Ok(Some(frame)) => route_inbound(frame, &pending).await,
            Ok(None) => {
                info!("RPC server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "RPC connection failed");
                break;
            }
        }
    }

    closed.cancel();
    // Dropping the senders ends every open response stream
    {
        let mut pending = lock_pending(&pending);
        pending.ended = true;
        pending.streams.clear();
    }
    state.mark_lost(generation);
}

async fn route_inbound(frame: Frame, pending: &PendingStreams) {
    let stream_id = match frame.stream_id() {
        Some(CONNECTION_STREAM_ID) | None => {
            match frame {
                Frame::Error { code, message, .. } => {
                    error!(%code, %message, "RPC server reported a connection error");
                    refuse_all(pending, code, message);
                }
                other => debug!(frame = ?other, "Ignoring connection-level frame"),
            }
            return;
        }
        Some(id) => id,
    };

    let sender = {
        let mut pending = lock_pending(pending);
        if frame.is_terminal() {
            pending.streams.remove(&stream_id)
        } else {
            pending.streams.get(&stream_id).cloned()
        }
    };

    match sender {
        Some(sender) => {
            if sender.send(frame).await.is_err() {
                lock_pending(pending).streams.remove(&stream_id);
            }
        }
        None => debug!(stream_id, "Frame for unknown or finished stream"),
    }
}

/// End every open stream with the server's connection error, and refuse
/// requests still to come on this connection.
fn refuse_all(pending: &PendingStreams, code: ErrorCode, message: String) {
    let streams = {
        let mut pending = lock_pending(pending);
        pending.refused = Some((code, message.clone()));
        std::mem::take(&mut pending.streams)
    };

    for (stream_id, sender) in streams {
        // A stream whose buffer is full still ends, just without the reason
        let _ = sender.try_send(Frame::error(stream_id, code, message.clone()));
    }
}

/// A request being built; see [`RpcRequester::route`].
pub struct RequestSpec {
    requester: RpcRequester,
    route: String,
    metadata: Option<Credentials>,
    data: AppResult<Value>,
}

impl RequestSpec {
    /// Credentials for this request only, overriding the setup credentials.
    pub fn metadata(mut self, credentials: impl Into<Option<Credentials>>) -> Self {
        self.metadata = credentials.into();
        self
    }

    /// Request payload.
    pub fn data<D: Serialize>(mut self, data: &D) -> Self {
        self.data = serde_json::to_value(data).map_err(AppError::from);
        self
    }

    /// Open a stream of responses.
    pub async fn retrieve_stream<T: DeserializeOwned>(self) -> AppResult<RpcStream<T>> {
        let data = self.data?;
        self.requester
            .start(self.route, self.metadata, data, false)
            .await
    }

    /// Ask for exactly one response.
    pub async fn retrieve_one<T: DeserializeOwned>(self) -> AppResult<T> {
        let data = self.data?;
        let route = self.route;
        let mut stream: RpcStream<T> = self
            .requester
            .start(route.clone(), self.metadata, data, true)
            .await?;

        match stream.next().await {
            Some(result) => result,
            None => Err(AppError::Protocol(format!(
                "route '{route}' completed without a response"
            ))),
        }
    }
}

/// Responses of one RPC stream.
///
/// Ends after `Complete`. A server `Error` frame or a lost connection is
/// yielded as a final `Err`. Dropping the stream before it ends sends
/// `Cancel` to the server.
pub struct RpcStream<T> {
    stream_id: u32,
    frames: mpsc::Receiver<Frame>,
    outbound: mpsc::Sender<Frame>,
    pending: PendingStreams,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RpcStream<T> {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl<T: DeserializeOwned> Stream for RpcStream<T> {
    type Item = AppResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            let frame = ready!(self.frames.poll_recv(cx));
            let item = match frame {
                Some(Frame::Next { data, .. }) => serde_json::from_value(data)
                    .map_err(|e| AppError::Protocol(format!("unexpected payload: {e}"))),
                Some(Frame::Complete { .. }) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Some(Frame::Error { code, message, .. }) => {
                    self.done = true;
                    Err(AppError::Remote {
                        code: code.as_str().to_string(),
                        message,
                    })
                }
                Some(other) => {
                    debug!(frame = ?other, "Ignoring unexpected frame on response stream");
                    continue;
                }
                None => {
                    self.done = true;
                    Err(AppError::Disconnected(
                        "connection closed before the stream completed".to_string(),
                    ))
                }
            };
            return Poll::Ready(Some(item));
        }
    }
}

impl<T> Drop for RpcStream<T> {
    fn drop(&mut self) {
        lock_pending(&self.pending).streams.remove(&self.stream_id);
        if !self.done {
            let _ = self.outbound.try_send(Frame::Cancel {
                stream_id: self.stream_id,
            });
        }
    }
}
