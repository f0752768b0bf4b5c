use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_stream::wrappers::IntervalStream;
use tracing::debug;

use crate::metrics;
use crate::models::{GreetingRequest, GreetingResponse};

/// A boxed, unbounded stream of greetings.
pub type GreetingStream = Pin<Box<dyn Stream<Item = GreetingResponse> + Send>>;

/// Produces greeting streams.
///
/// # Counter Memory Ordering
///
/// Both counters use `Ordering::Relaxed`: they only feed `/stats` and never
/// drive control flow.
#[derive(Clone)]
pub struct GreetingService {
    interval: Duration,
    counters: Arc<GreetingCounters>,
}

#[derive(Default)]
struct GreetingCounters {
    active: AtomicU64,
    emitted: AtomicU64,
}

/// Decrements the active stream count when its stream is dropped.
struct ActiveStream(Arc<GreetingCounters>);

impl ActiveStream {
    fn open(counters: Arc<GreetingCounters>) -> Self {
        counters.active.fetch_add(1, Ordering::Relaxed);
        metrics::adjust_greeting_streams(1.0);
        Self(counters)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
        metrics::adjust_greeting_streams(-1.0);
    }
}

impl GreetingService {
    /// Create a greeting service emitting one greeting per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            counters: Arc::new(GreetingCounters::default()),
        }
    }

    /// Greet `request.name` once per interval, forever.
    ///
    /// The first greeting arrives after one interval. Each message carries
    /// the time it was produced. The stream ends only when dropped.
    pub fn greet(&self, request: GreetingRequest) -> GreetingStream {
        debug!(name = %request.name, "Opening greeting stream");

        let active = ActiveStream::open(self.counters.clone());
        let counters = self.counters.clone();
        let name = request.name;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stream = IntervalStream::new(ticker).map(move |_| {
            // The guard lives exactly as long as the stream
            let _ = &active;
            counters.emitted.fetch_add(1, Ordering::Relaxed);
            metrics::record_greeting_emitted();
            GreetingResponse {
                message: greeting_message(&name, Utc::now()),
            }
        });

        Box::pin(stream)
    }

    /// Greeting streams currently open.
    pub fn active_streams(&self) -> u64 {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Greetings produced since startup.
    pub fn greetings_emitted(&self) -> u64 {
        self.counters.emitted.load(Ordering::Relaxed)
    }
}

/// `Hello {name} @ {timestamp}!` with an RFC 3339 UTC timestamp.
pub fn greeting_message(name: &str, at: DateTime<Utc>) -> String {
    format!(
        "Hello {name} @ {}!",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_greeting_message_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(
            greeting_message("Jane", at),
            "Hello Jane @ 2024-01-15T10:30:00.000Z!"
        );
    }

    #[tokio::test]
    async fn test_first_greeting_waits_one_interval() {
        let service = GreetingService::new(Duration::from_millis(50));
        let started = std::time::Instant::now();

        let mut stream = service.greet(GreetingRequest::new("Jane"));
        let first = stream.next().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(45));
        assert!(first.message.starts_with("Hello Jane @ "));
        assert!(first.message.ends_with('!'));
    }

    #[tokio::test]
    async fn test_stream_keeps_emitting() {
        let service = GreetingService::new(Duration::from_millis(5));
        let greetings: Vec<_> = service
            .greet(GreetingRequest::new("Josh"))
            .take(3)
            .collect()
            .await;

        assert_eq!(greetings.len(), 3);
        assert_eq!(service.greetings_emitted(), 3);
    }

    #[tokio::test]
    async fn test_active_count_follows_stream_lifetime() {
        let service = GreetingService::new(Duration::from_secs(1));

        let first = service.greet(GreetingRequest::new("A"));
        let second = service.greet(GreetingRequest::new("B"));
        assert_eq!(service.active_streams(), 2);

        drop(first);
        assert_eq!(service.active_streams(), 1);
        drop(second);
        assert_eq!(service.active_streams(), 0);
    }
}
