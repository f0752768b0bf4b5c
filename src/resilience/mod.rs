//! Failure handling for calls that leave the process.
//!
//! - `retry` - Bounded exponential backoff with jitter
//! - `circuit_breaker` - Fail fast while an upstream is known to be down
//!
//! The edge composes them as `circuit breaker ( retry ( call ) )` with a
//! fallback value when either gives up; see
//! [`ReservationClient::names`](crate::services::ReservationClient::names).

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{
    BACKOFF_JITTER_PERCENT, MIN_BACKOFF_DELAY, RetryPolicy, backoff_delay, rand_jitter,
    retry_with_backoff,
};
