//! Per-client rate limiting using the token bucket algorithm.
//!
//! # Algorithm
//!
//! Uses the Governor crate, which implements the Generic Cell Rate Algorithm
//! (GCRA). A bucket of `burst_capacity` tokens is refilled at
//! `replenish_rate` tokens per second; each request takes one.
//!
//! The same [`ClientRateLimiter`] backs both the global [`RateLimitLayer`]
//! and the gateway's `RequestRateLimiter` filter.
//!
//! # Response Headers
//!
//! Every response that went through a limiter carries:
//! - `X-RateLimit-Remaining`: tokens left for this client
//! - `X-RateLimit-Replenish-Rate`: tokens added per second
//! - `X-RateLimit-Burst-Capacity`: bucket size
//!
//! Rejected requests (429) also carry `Retry-After` in seconds.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::warn;

use super::ip::client_key;
use crate::config::Config;
use crate::metrics;

pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const REPLENISH_RATE_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-replenish-rate");
pub const BURST_CAPACITY_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-burst-capacity");

/// Error type for rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Replenish rate cannot be zero.
    ZeroRate,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroRate => write!(
                f,
                "replenish rate must be greater than 0; leave the limiter out for no limiting"
            ),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Keyed limiter whose positive outcome reports the remaining capacity.
type KeyedLimiter =
    RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Token bucket per client key.
pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    replenish_rate: u32,
    burst_capacity: u32,
}

impl ClientRateLimiter {
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroRate` if `replenish_rate` is 0.
    /// A burst capacity of 0 is raised to 1.
    pub fn new(replenish_rate: u32, burst_capacity: u32) -> Result<Self, RateLimitError> {
        let rate = NonZeroU32::new(replenish_rate).ok_or(RateLimitError::ZeroRate)?;
        Ok(Self::with_rate(rate, burst_capacity))
    }

    pub fn with_rate(replenish_rate: NonZeroU32, burst_capacity: u32) -> Self {
        let burst = NonZeroU32::new(burst_capacity).unwrap_or(NonZeroU32::MIN);

        let quota = Quota::per_second(replenish_rate).allow_burst(burst);
        let limiter = RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>();

        Self {
            limiter,
            replenish_rate: replenish_rate.get(),
            burst_capacity: burst.get(),
        }
    }

    pub fn replenish_rate(&self) -> u32 {
        self.replenish_rate
    }

    pub fn burst_capacity(&self) -> u32 {
        self.burst_capacity
    }

    /// Take one token from `key`'s bucket.
    pub fn check(&self, key: &str) -> RateDecision {
        match self.limiter.check_key(&key.to_string()) {
            Ok(snapshot) => RateDecision::Allowed {
                remaining: snapshot.remaining_burst_capacity(),
            },
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                RateDecision::Denied {
                    retry_after_secs: wait_time.as_secs().max(1),
                }
            }
        }
    }

    /// Write the rate limit headers for `decision` into `headers`.
    pub fn apply_headers(&self, decision: RateDecision, headers: &mut HeaderMap) {
        let remaining = match decision {
            RateDecision::Allowed { remaining } => remaining,
            RateDecision::Denied { retry_after_secs } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                0
            }
        };

        headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
        headers.insert(REPLENISH_RATE_HEADER, HeaderValue::from(self.replenish_rate));
        headers.insert(BURST_CAPACITY_HEADER, HeaderValue::from(self.burst_capacity));
    }

    /// 429 response for a denied decision.
    pub fn too_many_requests(&self, decision: RateDecision) -> Response<Body> {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"error":"too_many_requests","message":"Rate limit exceeded. Please retry later."}"#,
        )
            .into_response();
        self.apply_headers(decision, response.headers_mut());
        response
    }

    /// Drop buckets that are full again.
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
    }

    pub fn len(&self) -> usize {
        self.limiter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiter.is_empty()
    }
}

/// Global rate limiting layer, keyed by [`client_key`].
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(100, 50)?; // 100 RPS per client, 50 burst
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<ClientRateLimiter>,
}

impl RateLimitLayer {
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroRate` if `rps` is 0.
    pub fn new(rps: u32, burst: u32) -> Result<Self, RateLimitError> {
        Ok(Self {
            limiter: Arc::new(ClientRateLimiter::new(rps, burst)?),
        })
    }

    /// Layer for `RATE_LIMIT_RPS`/`RATE_LIMIT_BURST`; `None` when `RATE_LIMIT_RPS=0`.
    pub fn from_config(config: &Config) -> Option<Self> {
        NonZeroU32::new(config.rate_limit_rps).map(|rps| Self {
            limiter: Arc::new(ClientRateLimiter::with_rate(rps, config.rate_limit_burst)),
        })
    }

    pub fn limiter(&self) -> &Arc<ClientRateLimiter> {
        &self.limiter
    }

    /// Drop buckets of clients that have not been seen recently.
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<ClientRateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();
        let key = client_key(&req).into_owned();

        Box::pin(async move {
            let decision = limiter.check(&key);

            if let RateDecision::Denied { retry_after_secs } = decision {
                warn!(
                    client = %key,
                    path = %req.uri().path(),
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited("global");
                return Ok(limiter.too_many_requests(decision));
            }

            let mut response = inner.call(req).await?;
            limiter.apply_headers(decision, response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_returns_error() {
        assert!(matches!(
            ClientRateLimiter::new(0, 5),
            Err(RateLimitError::ZeroRate)
        ));
        assert!(RateLimitLayer::new(0, 5).is_err());
    }

    #[test]
    fn test_burst_then_denied() {
        let limiter = ClientRateLimiter::new(1, 3).unwrap();

        assert_eq!(limiter.check("a"), RateDecision::Allowed { remaining: 2 });
        assert_eq!(limiter.check("a"), RateDecision::Allowed { remaining: 1 });
        assert_eq!(limiter.check("a"), RateDecision::Allowed { remaining: 0 });
        assert!(!limiter.check("a").is_allowed());

        // Other clients have their own bucket
        assert!(limiter.check("b").is_allowed());
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_zero_burst_is_raised_to_one() {
        let limiter = ClientRateLimiter::new(1, 0).unwrap();
        assert_eq!(limiter.burst_capacity(), 1);
        assert!(limiter.check("a").is_allowed());
        assert!(!limiter.check("a").is_allowed());
    }

    #[test]
    fn test_layer_from_config() {
        assert!(RateLimitLayer::from_config(&Config::default()).is_none());

        let config = Config {
            rate_limit_rps: 10,
            rate_limit_burst: 4,
            ..Config::default()
        };
        let layer = RateLimitLayer::from_config(&config).unwrap();
        assert_eq!(layer.limiter().replenish_rate(), 10);
        assert_eq!(layer.limiter().burst_capacity(), 4);
    }

    #[test]
    fn test_prune_drops_replenished_buckets() {
        let layer = RateLimitLayer::new(1000, 1).unwrap();
        assert!(layer.limiter().check("10.0.0.1").is_allowed());
        assert_eq!(layer.limiter().len(), 1);

        // One token at 1000/s is back well within this sleep
        std::thread::sleep(std::time::Duration::from_millis(20));
        layer.prune();
        assert!(layer.limiter().is_empty());
    }

    #[test]
    fn test_headers_for_denied_request() {
        let limiter = ClientRateLimiter::new(5, 7).unwrap();
        let response = limiter.too_many_requests(RateDecision::Denied {
            retry_after_secs: 1,
        });

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get(&REMAINING_HEADER).unwrap(), "0");
        assert_eq!(headers.get(&REPLENISH_RATE_HEADER).unwrap(), "5");
        assert_eq!(headers.get(&BURST_CAPACITY_HEADER).unwrap(), "7");
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "1");
    }
}
