//! # Reservation Demo
//!
//! A reservation service and the edge in front of it, built with Axum:
//!
//! - **Reservations**: HTTP CRUD over an in-memory repository, with
//!   validated, all-or-nothing batch creation
//! - **Greetings**: unbounded greeting streams over SSE, WebSocket, and a
//!   length-prefixed JSON RPC channel (request-stream, request-response, cancel)
//! - **Edge**: greetings relayed from RPC, reservation names behind retry
//!   and a circuit breaker with a fallback, and a rate-limited gateway
//! - **Security**: HTTP Basic authentication, per-client rate limiting
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────────────────────────────────────┐
//!  HTTP ────► │ Edge (bin/edge.rs)                           │
//!             │  /greetings/{name}   ─► RpcRequester ────────┼──┐ RPC (TCP)
//!             │  /reservations/names ─► ReservationClient ───┼─┐│
//!             │  /proxy              ─► Gateway ─────────────┼─┤│
//!             └──────────────────────────────────────────────┘ ││
//!             ┌──────────────────────────────────────────────┐ ││
//!  HTTP ────► │ Reservation service (main.rs)                │◄┘│
//!             │  /reservations, /sse, /ws, /health, /stats   │  │
//!             │  RpcServer ─► MessageRouter ─► GreetingService◄──┘
//!             │  ReservationService ─► ReservationRepository │
//!             └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reservation_demo::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config);
//!     let app = build_router(state.clone());
//!
//!     // Serve `app` and `state.rpc_server`...
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Require Basic authentication on the reservation endpoints:
//! ```bash
//! AUTH_PROTECTED_PATHS=/reservations/** cargo run
//! ```
//!
//! Enable rate limiting:
//! ```bash
//! RATE_LIMIT_RPS=100 RATE_LIMIT_BURST=50 cargo run
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod resilience;
pub mod routes;
pub mod rpc;
pub mod services;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use gateway::{Gateway, RouteDefinition};
pub use routes::{build_edge_router, build_router};
pub use rpc::{RpcRequester, RpcServer};
pub use state::{AppState, EdgeState};
