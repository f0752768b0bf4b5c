//! Fixtures starting real in-process servers on ephemeral ports.
#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;

use futures_util::{Stream, StreamExt};
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use reservation_demo::{AppState, Config, EdgeState, build_edge_router, build_router};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reservation service: HTTP and RPC listeners.
pub struct ServiceFixture {
    pub base_url: String,
    pub rpc_addr: String,
    pub state: AppState,
    pub client: Client,
}

impl ServiceFixture {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", http_listener.local_addr().unwrap());
        let rpc_addr = rpc_listener.local_addr().unwrap().to_string();

        let mut config = Config {
            host: "127.0.0.1".to_string(),
            greeting_interval: Duration::from_millis(50),
            seed_sample_data: false,
            metrics_port: 0,
            ..Config::default()
        };
        configure(&mut config);

        let state = AppState::new(config);
        let app = build_router(state.clone());
        let shutdown = state.shutdown_token();

        tokio::spawn(state.rpc_server.clone().serve(rpc_listener, shutdown.clone()));
        tokio::spawn(async move {
            axum::serve(
                http_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .unwrap();
        });

        let rpc_server = state.rpc_server.clone();
        wait_until(move || rpc_server.is_listening()).await;

        Self {
            base_url,
            rpc_addr,
            state,
            client: client(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn seed(&self, names: &[&str]) {
        let names: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
        self.state.reservations.save_all_by_name(&names).await.unwrap();
    }
}

impl Drop for ServiceFixture {
    fn drop(&mut self) {
        self.state.shutdown_token().cancel();
    }
}

/// Edge in front of `service_url` (HTTP) and `rpc_addr` (greetings).
pub struct EdgeFixture {
    pub base_url: String,
    pub state: EdgeState,
    pub client: Client,
}

impl EdgeFixture {
    pub async fn start(service_url: &str, rpc_addr: &str) -> Self {
        Self::start_with(service_url, rpc_addr, |_| {}).await
    }

    pub async fn start_with(
        service_url: &str,
        rpc_addr: &str,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let mut config = Config {
            host: "127.0.0.1".to_string(),
            reservation_service_url: service_url.to_string(),
            greetings_rpc_addr: rpc_addr.to_string(),
            upstream_username: Some("jlong".to_string()),
            upstream_password: Some("pw".to_string()),
            upstream_timeout: Duration::from_secs(2),
            upstream_retry_max: 2,
            upstream_retry_base_delay: Duration::from_millis(10),
            upstream_retry_max_delay: Duration::from_millis(50),
            rpc_reconnect_max_attempts: 2,
            rpc_reconnect_base_delay: Duration::from_millis(10),
            rpc_reconnect_max_delay: Duration::from_millis(50),
            gateway_timeout: Duration::from_secs(2),
            edge_metrics_port: 0,
            ..Config::default()
        };
        configure(&mut config);

        let state = EdgeState::new(config).unwrap();
        let app = build_edge_router(state.clone());
        let shutdown = state.shutdown_token();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            base_url,
            state,
            client: client(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for EdgeFixture {
    fn drop(&mut self) {
        self.state.shutdown_token().cancel();
    }
}

pub fn client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create HTTP client")
}

/// An address nothing listens on.
pub async fn closed_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// An upstream that accepts connections and never answers.
pub async fn silent_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

/// An upstream answering every `GET /reservations` with 503, and its hit count.
pub async fn failing_upstream() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/reservations",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    timeout(STEP_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// The `data` of the next server-sent event carrying one.
pub async fn next_sse_data<S, B, E>(stream: &mut S, buffer: &mut String) -> String
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Debug,
{
    timeout(STEP_TIMEOUT, async {
        loop {
            while let Some(end) = buffer.find("\n\n") {
                let event: String = buffer.drain(..end + 2).collect();
                if let Some(data) = event.lines().find_map(|l| l.strip_prefix("data:")) {
                    return data.trim().to_string();
                }
            }

            let chunk = stream.next().await.expect("event stream ended").unwrap();
            buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()));
        }
    })
    .await
    .expect("no event in time")
}
