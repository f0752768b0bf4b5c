//! HTTP Basic authentication middleware.
//!
//! # Behaviour
//!
//! - Requests carrying valid `Authorization: Basic …` credentials get the
//!   matching [`Principal`](crate::models::Principal) inserted into their extensions, on every path.
//! - Requests carrying invalid credentials are rejected with 401.
//! - Requests without credentials pass through unless their path matches one
//!   of the protected [`PathPattern`]s, in which case they get 401 with
//!   `WWW-Authenticate: Basic realm="reservation_demo"`.
//!
//! # Brute Force Protection
//!
//! Every rejected attempt takes a token from a per-client failure limiter
//! (10 per minute, burst 5). Once it runs dry the client is blocked with 429
//! until the limiter would admit another failure, even if it then presents
//! valid credentials.
//!
//! # Usage
//!
//! ```bash
//! AUTH_PROTECTED_PATHS=/reservations/** cargo run
//! curl -u jlong:pw http://localhost:8080/reservations
//! ```

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::extract_client_ip;
use super::path::PathPattern;
use crate::metrics;
use crate::models::Credentials;
use crate::services::UserStore;

/// Realm announced in `WWW-Authenticate`.
pub const REALM: &str = "reservation_demo";

/// Maximum auth failures per client per minute.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Burst capacity of the failure limiter.
const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Tracks failed attempts per client and who is currently blocked.
struct FailureGuard {
    limiter: AuthFailureLimiter,
    blocked: Mutex<HashMap<String, Instant>>,
}

impl FailureGuard {
    fn new() -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            limiter: RateLimiter::keyed(quota),
            blocked: Mutex::new(HashMap::new()),
        }
    }

    /// Seconds until `client` may try again, if it is blocked.
    fn blocked_for(&self, client: &str) -> Option<u64> {
        let mut blocked = self.blocked.lock().unwrap_or_else(PoisonError::into_inner);
        let until = *blocked.get(client)?;
        let now = Instant::now();

        if until <= now {
            blocked.remove(client);
            return None;
        }
        Some(until.duration_since(now).as_secs().max(1))
    }

    /// Record a failed attempt. Returns the block duration in seconds when
    /// this failure exhausted the client's allowance.
    fn record_failure(&self, client: &str) -> Option<u64> {
        let not_until = self.limiter.check_key(&client.to_string()).err()?;
        let wait = not_until.wait_time_from(DefaultClock::default().now());
        let wait = wait.max(Duration::from_secs(1));

        self.blocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.to_string(), Instant::now() + wait);
        Some(wait.as_secs().max(1))
    }

    /// Forget expired blocks and failure buckets that have fully replenished.
    fn prune(&self) {
        let now = Instant::now();
        self.blocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, until| *until > now);
        self.limiter.retain_recent();
    }

    fn blocked_len(&self) -> usize {
        self.blocked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Basic authentication layer.
#[derive(Clone)]
pub struct BasicAuthLayer {
    users: UserStore,
    protected: Arc<Vec<PathPattern>>,
    failures: Arc<FailureGuard>,
}

impl BasicAuthLayer {
    /// `protected_paths` use [`PathPattern`] notation.
    pub fn new(users: UserStore, protected_paths: &[String]) -> Self {
        Self {
            users,
            protected: Arc::new(
                protected_paths
                    .iter()
                    .map(|p| PathPattern::parse(p))
                    .collect(),
            ),
            failures: Arc::new(FailureGuard::new()),
        }
    }

    /// Whether any path requires authentication.
    pub fn is_enforcing(&self) -> bool {
        !self.protected.is_empty()
    }

    pub fn protected_paths(&self) -> &[PathPattern] {
        &self.protected
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|p| p.matches(path))
    }

    /// Drop per-client failure state that no longer affects anyone.
    pub fn prune(&self) {
        self.failures.prune();
    }

    /// Clients currently blocked or awaiting expiry of their block.
    pub fn blocked_clients(&self) -> usize {
        self.failures.blocked_len()
    }
}

impl<S> Layer<S> for BasicAuthLayer {
    type Service = BasicAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BasicAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

/// Basic authentication service wrapper.
#[derive(Clone)]
pub struct BasicAuthService<S> {
    inner: S,
    auth: BasicAuthLayer,
}

impl<S> Service<Request<Body>> for BasicAuthService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let protected = auth.is_protected(req.uri().path());
            let credentials = match extract_credentials(&req) {
                Ok(credentials) => credentials,
                Err(reason) => {
                    return Ok(reject(&auth, &req, reason));
                }
            };

            let Some(credentials) = credentials else {
                if protected {
                    return Ok(reject(&auth, &req, "Authentication required"));
                }
                return inner.call(req).await;
            };

            let client_ip = extract_client_ip(&req).into_owned();
            if let Some(retry_after) = auth.failures.blocked_for(&client_ip) {
                error!(
                    client_ip = %client_ip,
                    retry_after_secs = retry_after,
                    "Client blocked due to excessive auth failures"
                );
                return Ok(rate_limited_response(retry_after));
            }

            match auth.users.authenticate(&credentials) {
                Some(principal) => {
                    debug!(user = %principal.username, "Basic authentication successful");
                    req.extensions_mut().insert(principal);
                    inner.call(req).await
                }
                None => Ok(reject(&auth, &req, "Invalid credentials")),
            }
        })
    }
}

/// Record the failure and build the 401 (or 429 once the client is blocked).
fn reject<B>(auth: &BasicAuthLayer, req: &Request<B>, reason: &str) -> Response<Body> {
    let client_ip = extract_client_ip(req).into_owned();
    metrics::record_auth_failure("http");

    if let Some(retry_after) = auth.failures.blocked_for(&client_ip) {
        return rate_limited_response(retry_after);
    }

    warn!(
        path = %req.uri().path(),
        client_ip = %client_ip,
        reason,
        "Basic authentication failed"
    );

    match auth.failures.record_failure(&client_ip) {
        Some(retry_after) => {
            error!(
                client_ip = %client_ip,
                retry_after_secs = retry_after,
                "Blocking client after repeated auth failures"
            );
            rate_limited_response(retry_after)
        }
        None => unauthorized_response(reason),
    }
}

/// Parse `Authorization: Basic …`.
///
/// `Ok(None)` when the header is absent or uses another scheme; `Err` when
/// it is a malformed Basic header.
fn extract_credentials<B>(req: &Request<B>) -> Result<Option<Credentials>, &'static str> {
    let Some(value) = req.headers().get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| "Malformed Authorization header")?;

    let Some((scheme, encoded)) = value.trim().split_once(' ') else {
        return Ok(None);
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return Ok(None);
    }

    decode_basic(encoded.trim())
        .map(Some)
        .ok_or("Malformed Basic credentials")
}

fn decode_basic(encoded: &str) -> Option<Credentials> {
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::new(username, password))
}

/// Build an unauthorized (401) response.
fn unauthorized_response(message: &str) -> Response<Body> {
    let challenge = format!(r#"Basic realm="{REALM}""#);
    let mut response = (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "application/json")],
        format!(r#"{{"error":"unauthorized","message":"{message}"}}"#),
    )
        .into_response();

    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// Build a rate limited (429) response for auth failures.
fn rate_limited_response(retry_after: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, retry_after.to_string()),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        r#"{"error":"too_many_requests","message":"Too many failed authentication attempts. Please wait before retrying."}"#,
    )
        .into_response()
}
