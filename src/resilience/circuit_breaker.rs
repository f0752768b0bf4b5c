//! Circuit breaker guarding the edge's calls to the reservation service.
//!
//! ```text
//!   Closed ──failures ≥ threshold──► Open ──open_duration elapsed──► HalfOpen
//!     ▲                                ▲                                │
//!     └────successes ≥ threshold───────┼────────────────────────────────┤
//!                                      └──────────any failure───────────┘
//! ```
//!
//! While open, [`CircuitBreaker::call`] fails with `AppError::CircuitOpen`
//! without running the operation, so callers can answer with a fallback
//! immediately instead of waiting out a full retry cycle.
//!
//! Half-open admits one trial call at a time; concurrent callers are
//! rejected as if the circuit were still open.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
    /// Testing recovery - requests pass through as trials.
    HalfOpen,
}

impl CircuitState {
    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    pub fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Thresholds for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing the circuit.
    pub success_threshold: u32,
    /// Time spent open before probing again.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_duration,
        }
    }
}

impl From<&Config> for CircuitBreakerConfig {
    fn from(config: &Config) -> Self {
        Self::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_success_threshold,
            config.circuit_breaker_open_duration,
        )
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl Inner {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        metrics::record_circuit_breaker_open();
        metrics::set_circuit_breaker_state(CircuitState::Open.as_gauge());
    }
}

/// How a request got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    /// Holds the half-open trial slot under this id
    Trial(u64),
}

/// Gives the trial slot back when the call ends, including by cancellation.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    id: Option<u64>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.breaker.release_trial(id);
        }
    }
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    /// Id of the half-open trial in flight, 0 when the slot is free
    trial_owner: AtomicU64,
    next_trial: AtomicU64,
    times_opened: AtomicU32,
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
            trial_owner: AtomicU64::new(0),
            next_trial: AtomicU64::new(1),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected calls return `AppError::CircuitOpen`. Any error from `op`
    /// counts as a failure.
    pub async fn call<F, Fut, T>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let Some(admission) = self.admit().await else {
            return Err(AppError::CircuitOpen(format!(
                "retrying in at most {:?}",
                self.config.open_duration
            )));
        };
        let _slot = TrialSlot {
            breaker: self,
            id: match admission {
                Admission::Trial(id) => Some(id),
                Admission::Pass => None,
            },
        };

        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(e)
            }
        }
    }

    /// Whether a request may proceed. Moves Open to HalfOpen once the open
    /// duration has elapsed.
    ///
    /// In HalfOpen this takes the single trial slot, which the next
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) gives back.
    pub async fn allow_request(&self) -> bool {
        self.admit().await.is_some()
    }

    async fn admit(&self) -> Option<Admission> {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed => return Some(Admission::Pass),
                CircuitState::HalfOpen => return self.claim_trial(),
                CircuitState::Open => {
                    if let Some(opened_at) = inner.opened_at
                        && opened_at.elapsed() < self.config.open_duration
                    {
                        self.reject();
                        return None;
                    }
                }
            }
        }

        // Open and expired: re-check under the write lock
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => Some(Admission::Pass),
            CircuitState::HalfOpen => self.claim_trial(),
            CircuitState::Open => {
                if let Some(opened_at) = inner.opened_at
                    && opened_at.elapsed() >= self.config.open_duration
                {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    self.trial_owner.store(0, Ordering::Release);
                    metrics::set_circuit_breaker_state(CircuitState::HalfOpen.as_gauge());
                    info!("Circuit breaker half-open, probing upstream");
                    return self.claim_trial();
                }
                self.reject();
                None
            }
        }
    }

    fn claim_trial(&self) -> Option<Admission> {
        let id = self.next_trial.fetch_add(1, Ordering::Relaxed);
        match self
            .trial_owner
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(Admission::Trial(id)),
            Err(_) => {
                debug!("Circuit breaker trial call already in flight");
                self.reject();
                None
            }
        }
    }

    fn release_trial(&self, id: u64) {
        // Only the holder frees the slot
        let _ = self
            .trial_owner
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn reject(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_rejection();
    }

    pub async fn record_success(&self) {
        self.on_success().await;
        self.trial_owner.store(0, Ordering::Release);
    }

    pub async fn record_failure(&self) {
        self.on_failure().await;
        self.trial_owner.store(0, Ordering::Release);
    }

    async fn on_success(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                debug!(
                    consecutive_successes = inner.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker trial succeeded"
                );

                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.consecutive_failures = 0;
                    metrics::set_circuit_breaker_state(CircuitState::Closed.as_gauge());
                    info!("Circuit breaker closed, upstream recovered");
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late
                debug!("Success recorded while circuit is open");
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                debug!(
                    consecutive_failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker recorded failure"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        failures = inner.consecutive_failures,
                        open_duration = ?self.config.open_duration,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open();
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!("Circuit breaker reopened, trial failed");
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
