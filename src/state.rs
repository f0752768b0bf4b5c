//! Shared application state for Axum handlers.
//!
//! Two flavours, one per binary:
//!
//! - [`AppState`]: the reservation service (repository, greetings, RPC
//!   listener handle, cached statistics)
//! - [`EdgeState`]: the edge (reservation client, greetings requester,
//!   gateway)
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::gateway::{Gateway, RouteDefinition};
use crate::metrics;
use crate::middleware::ClientGuards;
use crate::repository::{InMemoryReservationRepository, ReservationRepository};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::rpc::{RequesterOptions, RpcRequester, RpcServer, greeting_routes};
use crate::services::{
    GreetingService, GreetingsClient, ReservationClient, ReservationService, UserStore,
};

/// How often the cached reservation count is refreshed.
pub const STATS_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// How often the edge checks its RPC connection and prunes limiter buckets.
pub const EDGE_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

/// How often the service prunes per-client auth and rate limit state.
pub const CLIENT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Cached statistics for the `/stats` endpoint.
#[derive(Debug, Clone, Default)]
pub struct CachedStats {
    /// Number of stored reservations
    pub reservations_count: u64,
    /// When these stats were last updated
    pub last_updated: Option<Instant>,
}

impl CachedStats {
    /// Check if the cache is stale (hasn't been updated in `ttl`).
    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.last_updated {
            Some(updated) => updated.elapsed() > ttl,
            None => true,
        }
    }
}

/// Owns the background tasks of a state and stops them on shutdown.
#[derive(Clone, Default)]
struct Background {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Background {
    /// Run `tick` every `period` until shutdown. The first run is immediate
    /// when `immediate` is set.
    fn every<F, Fut>(&self, name: &'static str, period: Duration, immediate: bool, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let mut ticker = interval(period);
            if !immediate {
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!(task = name, "Background task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;

                            _ = cancel.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }

            debug!(task = name, "Background task shutting down");
        });
    }

    async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All background tasks have completed");
    }
}

/// State of the reservation service.
///
/// ```rust,ignore
/// let state = AppState::new(config);
/// let rpc = state.rpc_server.clone();
/// // ... serve HTTP and RPC ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub reservations: ReservationService,
    pub greetings: GreetingService,
    /// Shares counters with the server actually listening
    pub rpc_server: RpcServer,
    /// Auth and rate limit layers of the router
    pub guards: ClientGuards,
    pub started_at: Instant,
    pub config: Arc<Config>,
    stats_cache: Arc<RwLock<CachedStats>>,
    background: Background,
}

impl AppState {
    /// State over a fresh in-memory repository.
    pub fn new(config: Config) -> Self {
        Self::with_repository(config, Arc::new(InMemoryReservationRepository::new()))
    }

    /// Spawns the stats refresh and client pruning tasks.
    pub fn with_repository(config: Config, repository: Arc<dyn ReservationRepository>) -> Self {
        let reservations = ReservationService::new(repository);
        let greetings = GreetingService::new(config.greeting_interval);
        let users = UserStore::new(config.auth_users.clone());
        let rpc_server = RpcServer::new(greeting_routes(greetings.clone()), users.clone(), &config);
        let guards = ClientGuards::new(&config, users, &config.auth_protected_paths);

        let state = Self {
            reservations,
            greetings,
            rpc_server,
            guards,
            started_at: Instant::now(),
            config: Arc::new(config),
            stats_cache: Arc::new(RwLock::new(CachedStats::default())),
            background: Background::default(),
        };

        state.spawn_stats_refresh_task();
        state.spawn_client_pruning_task();
        state
    }

    pub async fn cached_stats(&self) -> CachedStats {
        self.stats_cache.read().await.clone()
    }

    /// Recount reservations now.
    pub async fn refresh_stats(&self) {
        refresh_stats_impl(&self.reservations, &self.stats_cache).await;
    }

    fn spawn_stats_refresh_task(&self) {
        let reservations = self.reservations.clone();
        let stats_cache = self.stats_cache.clone();

        self.background
            .every("stats_refresh", STATS_REFRESH_INTERVAL, true, move || {
                let reservations = reservations.clone();
                let stats_cache = stats_cache.clone();
                async move { refresh_stats_impl(&reservations, &stats_cache).await }
            });
    }

    fn spawn_client_pruning_task(&self) {
        let guards = self.guards.clone();

        self.background
            .every("client_pruning", CLIENT_PRUNE_INTERVAL, false, move || {
                let guards = guards.clone();
                async move { guards.prune() }
            });
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); hand it to the RPC
    /// server so both stop together.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.background.cancel.clone()
    }

    /// Stop background tasks and wait for them.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

async fn refresh_stats_impl(reservations: &ReservationService, cache: &RwLock<CachedStats>) {
    match reservations.count().await {
        Ok(count) => {
            let mut cache = cache.write().await;
            *cache = CachedStats {
                reservations_count: count as u64,
                last_updated: Some(Instant::now()),
            };
            trace!(count, "Stats cache refreshed");
        }
        Err(e) => warn!(error = %e, "Stats refresh failed"),
    }
}

/// State of the edge.
#[derive(Clone)]
pub struct EdgeState {
    pub reservations: ReservationClient,
    pub greetings: GreetingsClient,
    pub gateway: Gateway,
    pub breaker: Arc<CircuitBreaker>,
    /// Auth and rate limit layers of the router
    pub guards: ClientGuards,
    pub started_at: Instant,
    pub config: Arc<Config>,
    background: Background,
}

impl EdgeState {
    /// Build the edge's clients and gateway. The RPC connection is opened
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if an HTTP client or gateway route
    /// cannot be built.
    pub fn new(config: Config) -> crate::AppResult<Self> {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from(&config)));
        let reservations = ReservationClient::new(&config, breaker.clone())?;

        let requester = RpcRequester::new(
            config.greetings_rpc_addr.clone(),
            config.upstream_credentials(),
            RequesterOptions::from(&config),
        );
        let greetings = GreetingsClient::new(requester, config.upstream_credentials());

        let gateway = Gateway::new(
            vec![RouteDefinition::reservations_proxy(&config)?],
            config.gateway_timeout,
        )?;

        let guards = ClientGuards::new(
            &config,
            UserStore::new(config.auth_users.clone()),
            &config.edge_auth_protected_paths,
        );

        let state = Self {
            reservations,
            greetings,
            gateway,
            breaker,
            guards,
            started_at: Instant::now(),
            config: Arc::new(config),
            background: Background::default(),
        };

        state.spawn_housekeeping_task();
        Ok(state)
    }

    /// Reconnects the RPC requester when it is down, publishes breaker
    /// state, prunes idle per-client state.
    fn spawn_housekeeping_task(&self) {
        let requester = self.greetings.requester().clone();
        let breaker = self.breaker.clone();
        let gateway = self.gateway.clone();
        let guards = self.guards.clone();

        self.background
            .every("edge_housekeeping", EDGE_HOUSEKEEPING_INTERVAL, true, move || {
                let requester = requester.clone();
                let breaker = breaker.clone();
                let gateway = gateway.clone();
                let guards = guards.clone();
                async move {
                    if requester.is_connected() {
                        trace!("Health check: RPC connection OK");
                    } else if !requester.is_reconnecting() {
                        warn!(addr = requester.addr(), "Health check: RPC connection is down");
                        match requester.ensure_connected().await {
                            Ok(()) => info!(addr = requester.addr(), "RPC connection restored"),
                            Err(e) => warn!(error = %e, "RPC reconnection failed"),
                        }
                    }

                    metrics::set_circuit_breaker_state(breaker.state().await.as_gauge());

                    gateway.retain_recent();
                    guards.prune();
                }
            });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.background.cancel.clone()
    }

    /// Stop background tasks and close the RPC connection.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
        self.greetings.requester().close().await;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_stats_staleness() {
        let stats = CachedStats::default();
        assert!(stats.is_stale(Duration::from_secs(60)));

        let fresh = CachedStats {
            reservations_count: 1,
            last_updated: Some(Instant::now()),
        };
        assert!(!fresh.is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_refresh_stats_counts_reservations() {
        let state = AppState::new(Config::default());
        state.reservations.create("Josh").await.unwrap();
        state.reservations.create("Dr. Syer").await.unwrap();

        state.refresh_stats().await;

        let stats = state.cached_stats().await;
        assert_eq!(stats.reservations_count, 2);
        assert!(stats.last_updated.is_some());

        state.shutdown().await;
        assert!(state.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_edge_state_builds_default_route() {
        let state = EdgeState::new(Config::default()).unwrap();

        assert!(state.gateway.find("/proxy", None).is_some());

        state.shutdown().await;
    }
}
