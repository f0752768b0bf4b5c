//! HTTP client the edge uses to read reservations from the reservation service.
//!
//! # Resilience
//!
//! [`ReservationClient::names`] never fails: each call runs the request with
//! retry and backoff inside the circuit breaker, and answers with
//! [`FALLBACK_NAMES`] when the upstream stays down or the circuit is open.
//!
//! ```text
//! breaker ( time limit ( retry ( GET /reservations ) ) )
//! ```
//!
//! The time limit bounds the whole retry cycle, so a hung upstream costs a
//! caller at most `UPSTREAM_TIME_LIMIT_SECS` and counts as one breaker failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Credentials, Reservation};
use crate::resilience::{CircuitBreaker, RetryPolicy, retry_with_backoff};

/// Answer of [`ReservationClient::names`] when the upstream is unavailable.
pub const FALLBACK_NAMES: [&str; 1] = ["EEEK!"];

#[derive(Clone)]
pub struct ReservationClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    time_limit: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl ReservationClient {
    /// Build a client for `RESERVATION_SERVICE_URL` sharing `breaker`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the HTTP client cannot be built.
    pub fn new(config: &Config, breaker: Arc<CircuitBreaker>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.reservation_service_url.trim_end_matches('/').to_string(),
            credentials: config.upstream_credentials(),
            retry: RetryPolicy::upstream(config),
            time_limit: config.upstream_time_limit,
            breaker,
        })
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the limit on a whole call.
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Fetch every reservation with a single request.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn all(&self) -> AppResult<Vec<Reservation>> {
        let url = format!("{}/reservations", self.base_url);

        let mut request = self.http.get(&url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await.map_err(upstream_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!("GET {url} returned {status}")));
        }

        let reservations: Vec<Reservation> = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("invalid reservations payload: {e}")))?;

        debug!(count = reservations.len(), "Fetched reservations");
        Ok(reservations)
    }

    /// Names of all reservations, or [`FALLBACK_NAMES`].
    #[instrument(skip(self))]
    pub async fn names(&self) -> Vec<String> {
        let limit = self.time_limit;
        let mut time_limited = false;

        let result = {
            let time_limited = &mut time_limited;
            self.breaker
                .call(move || async move {
                    let retried =
                        retry_with_backoff(&self.retry, "reservation_names", || self.all());
                    match timeout(limit, retried).await {
                        Ok(result) => result,
                        Err(_) => {
                            *time_limited = true;
                            Err(AppError::OperationTimeout(format!(
                                "reservation service gave no answer within {limit:?}"
                            )))
                        }
                    }
                })
                .await
        };

        match result {
            Ok(reservations) => reservations.into_iter().map(|r| r.name).collect(),
            Err(e) => {
                let reason = match e {
                    AppError::CircuitOpen(_) => "circuit_open",
                    _ if time_limited => "time_limit",
                    _ => "retries_exhausted",
                };
                warn!(error = %e, reason, "Serving fallback reservation names");
                metrics::record_upstream_fallback(reason);
                FALLBACK_NAMES.iter().map(|s| (*s).to_string()).collect()
            }
        }
    }
}

fn upstream_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::OperationTimeout(format!("reservation service: {e}"))
    } else {
        AppError::Upstream(e.to_string())
    }
}
