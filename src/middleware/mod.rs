//! HTTP middleware for authentication and rate limiting.
//!
//! - **Basic Authentication**: user store lookup with constant-time
//!   password comparison and brute force protection
//! - **Rate Limiting**: token bucket per client with configurable rate and burst
//! - **Client Keys**: principal name or client IP, shared by both
//!
//! Request IDs, tracing, and CORS come from `tower-http` and are wired in
//! [`crate::routes`].
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → CORS → Basic Auth → Rate Limiter → Handler
//!                                           ↓              ↓
//!                                  401 / 429 blocked   429 Too Many
//! ```

pub mod auth;
pub mod ip;
pub mod path;
pub mod rate_limit;

pub use auth::{BasicAuthLayer, REALM};
pub use ip::{UNKNOWN_CLIENT, client_key, extract_client_ip};
pub use path::PathPattern;
pub use rate_limit::{
    BURST_CAPACITY_HEADER, ClientRateLimiter, REMAINING_HEADER, REPLENISH_RATE_HEADER,
    RateDecision, RateLimitError, RateLimitLayer,
};

use crate::config::Config;
use crate::services::UserStore;

/// Auth and rate limit layers of one router, kept by the application state
/// so housekeeping can prune their per-client maps.
#[derive(Clone)]
pub struct ClientGuards {
    pub auth: BasicAuthLayer,
    pub rate_limit: Option<RateLimitLayer>,
}

impl ClientGuards {
    pub fn new(config: &Config, users: UserStore, protected_paths: &[String]) -> Self {
        Self {
            auth: BasicAuthLayer::new(users, protected_paths),
            rate_limit: RateLimitLayer::from_config(config),
        }
    }

    pub fn prune(&self) {
        self.auth.prune();
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.prune();
        }
    }
}
