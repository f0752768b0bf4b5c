//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! Both binaries (the reservation service and the edge) read the same
//! [`Config`]; each one only uses the groups it needs. Everything has a
//! development default, so `cargo run` and `cargo run --bin edge` work side
//! by side on one machine without any environment set.
//!
//! # Security Configuration
//!
//! - `AUTH_USERS`: `user:password:ROLE[+ROLE]` entries, comma-separated
//! - `AUTH_PROTECTED_PATHS`: service paths requiring basic auth (default: none)
//! - `EDGE_AUTH_PROTECTED_PATHS`: edge paths requiring basic auth (default: `/proxy`)
//! - `RPC_AUTH_REQUIRED`: reject unauthenticated RPC requests (default: false)
//!
//! # Upstream Resilience
//!
//! - `UPSTREAM_RETRY_MAX`: retries after the first failed call (default: 10)
//! - `UPSTREAM_RETRY_BASE_DELAY_MS`: first backoff delay (default: 1000)
//! - `UPSTREAM_TIMEOUT_SECS`: per-attempt timeout (default: 5)
//! - `UPSTREAM_TIME_LIMIT_SECS`: limit on a whole call, retries included (default: 5)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::Credentials;

/// Names seeded into an empty repository at service startup.
pub const DEFAULT_SAMPLE_RESERVATIONS: [&str; 8] = [
    "Josh", "Madhura", "Spencer", "Olga", "Dave", "Violetta", "Stephane", "Ria",
];

/// A user account for basic and RPC authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub username: String,
    pub password: String,
    pub roles: Vec<String>,
}

impl UserAccount {
    /// Parse a `user:password:ROLE+ROLE` entry. Roles default to `USER`.
    pub fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.trim().splitn(3, ':');
        let username = parts.next()?.trim();
        let password = parts.next()?.trim();
        if username.is_empty() || password.is_empty() {
            return None;
        }

        let roles: Vec<String> = parts
            .next()
            .map(|r| {
                r.split('+')
                    .map(|role| role.trim().to_uppercase())
                    .filter(|role| !role.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
            roles: if roles.is_empty() {
                vec!["USER".to_string()]
            } else {
                roles
            },
        })
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Service will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Bind address for every listener (default: "0.0.0.0")
    pub host: String,

    /// Reservation service HTTP port (default: 8080)
    pub port: u16,

    /// Reservation service RPC port (default: 7000)
    pub rpc_port: u16,

    /// Edge HTTP port (default: 8081)
    pub edge_port: u16,

    // =========================================================================
    // Greetings & Sample Data
    // =========================================================================
    /// Delay between two greetings of one stream (default: 1 second)
    pub greeting_interval: Duration,

    /// Whether to reset and seed the repository at startup (default: true)
    pub seed_sample_data: bool,

    /// Names used for seeding
    pub sample_reservations: Vec<String>,

    // =========================================================================
    // Upstream Configuration (edge)
    // =========================================================================
    /// Base URL of the reservation service
    pub reservation_service_url: String,

    /// `host:port` of the greetings RPC endpoint
    pub greetings_rpc_addr: String,

    /// Credentials the edge presents to the service (HTTP basic + RPC metadata)
    pub upstream_username: Option<String>,
    pub upstream_password: Option<String>,

    /// Timeout for a single upstream HTTP attempt
    pub upstream_timeout: Duration,

    /// Limit on a whole upstream call including retries; the fallback is
    /// served once it elapses
    pub upstream_time_limit: Duration,

    /// Retries after the first failed upstream call
    pub upstream_retry_max: u32,

    /// First retry delay (doubles per attempt)
    pub upstream_retry_base_delay: Duration,

    /// Retry delay cap
    pub upstream_retry_max_delay: Duration,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Number of consecutive failures before opening the circuit (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// Number of consecutive successes in half-open state to close circuit (default: 2)
    pub circuit_breaker_success_threshold: u32,

    /// How long the circuit stays open before transitioning to half-open (default: 30s)
    pub circuit_breaker_open_duration: Duration,

    // =========================================================================
    // RPC Configuration
    // =========================================================================
    /// Reject RPC requests without valid credentials
    pub rpc_auth_required: bool,

    /// Largest accepted RPC frame in bytes (default: 1 MiB)
    pub rpc_max_frame_bytes: usize,

    /// Maximum RPC reconnection attempts before giving up (0 = infinite)
    pub rpc_reconnect_max_attempts: u32,

    /// Base delay between RPC reconnection attempts
    pub rpc_reconnect_base_delay: Duration,

    /// Maximum delay between RPC reconnection attempts
    pub rpc_reconnect_max_delay: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Known users for basic and RPC authentication
    pub auth_users: Vec<UserAccount>,

    /// Service paths requiring authentication (`/x`, `/x/**`, `/**`)
    pub auth_protected_paths: Vec<String>,

    /// Edge paths requiring authentication
    pub edge_auth_protected_paths: Vec<String>,

    /// Allowed CORS origins ("*" for any)
    pub cors_allowed_origins: Vec<String>,

    /// Maximum request body size in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Global requests per second per client (0 = disabled, the default)
    pub rate_limit_rps: u32,

    /// Burst capacity of the global limiter
    pub rate_limit_burst: u32,

    // =========================================================================
    // Gateway Configuration (edge)
    // =========================================================================
    /// Incoming path of the default proxy route
    pub gateway_route_path: String,

    /// Optional host glob (e.g. `*.spring.io`) the request must match
    pub gateway_host: Option<String>,

    /// Path the upstream request is rewritten to
    pub gateway_set_path: Option<String>,

    /// Value for `Access-Control-Allow-Origin` on proxied responses (None = not added)
    pub gateway_allow_origin: Option<String>,

    /// Tokens added per second to each client bucket (0 = no route limiter)
    pub gateway_replenish_rate: u32,

    /// Bucket size of the route limiter
    pub gateway_burst_capacity: u32,

    /// Timeout for a proxied upstream call
    pub gateway_timeout: Duration,

    // =========================================================================
    // Edge Behaviour
    // =========================================================================
    /// Log reservations and greetings at edge startup
    pub edge_startup_checks: bool,

    /// Name the startup check asks greetings for
    pub check_greeting_name: String,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Prometheus port of the service (0 = disabled)
    pub metrics_port: u16,

    /// Prometheus port of the edge (0 = disabled)
    pub edge_metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a value cannot be parsed or the
    /// combination of values is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,
            rpc_port: Self::parse_env("RPC_PORT", defaults.rpc_port)?,
            edge_port: Self::parse_env("EDGE_PORT", defaults.edge_port)?,

            // Greetings & sample data
            greeting_interval: Duration::from_millis(Self::parse_env(
                "GREETING_INTERVAL_MS",
                1000,
            )?),
            seed_sample_data: Self::parse_env("SEED_SAMPLE_DATA", true)?,
            sample_reservations: Self::parse_list("SAMPLE_RESERVATIONS")
                .unwrap_or(defaults.sample_reservations),

            // Upstream
            reservation_service_url: env::var("RESERVATION_SERVICE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.reservation_service_url),
            greetings_rpc_addr: env::var("GREETINGS_RPC_ADDR")
                .unwrap_or(defaults.greetings_rpc_addr),
            upstream_username: env::var("UPSTREAM_USERNAME").ok().filter(|u| !u.is_empty()),
            upstream_password: env::var("UPSTREAM_PASSWORD").ok().filter(|p| !p.is_empty()),
            upstream_timeout: Duration::from_secs(Self::parse_env("UPSTREAM_TIMEOUT_SECS", 5)?),
            upstream_time_limit: Duration::from_secs(Self::parse_env(
                "UPSTREAM_TIME_LIMIT_SECS",
                5,
            )?),
            upstream_retry_max: Self::parse_env("UPSTREAM_RETRY_MAX", defaults.upstream_retry_max)?,
            upstream_retry_base_delay: Duration::from_millis(Self::parse_env(
                "UPSTREAM_RETRY_BASE_DELAY_MS",
                1000,
            )?),
            upstream_retry_max_delay: Duration::from_millis(Self::parse_env(
                "UPSTREAM_RETRY_MAX_DELAY_MS",
                30000,
            )?),

            // Circuit breaker
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_success_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD",
                2,
            )?,
            circuit_breaker_open_duration: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?),

            // RPC
            rpc_auth_required: Self::parse_env("RPC_AUTH_REQUIRED", false)?,
            rpc_max_frame_bytes: Self::parse_env("RPC_MAX_FRAME_BYTES", 1024 * 1024)?,
            rpc_reconnect_max_attempts: Self::parse_env("RPC_RECONNECT_MAX_ATTEMPTS", 5)?,
            rpc_reconnect_base_delay: Duration::from_millis(Self::parse_env(
                "RPC_RECONNECT_BASE_DELAY_MS",
                500,
            )?),
            rpc_reconnect_max_delay: Duration::from_millis(Self::parse_env(
                "RPC_RECONNECT_MAX_DELAY_MS",
                10000,
            )?),

            // Security
            auth_users: Self::parse_users()?.unwrap_or(defaults.auth_users),
            auth_protected_paths: Self::parse_list("AUTH_PROTECTED_PATHS")
                .unwrap_or(defaults.auth_protected_paths),
            edge_auth_protected_paths: Self::parse_list("EDGE_AUTH_PROTECTED_PATHS")
                .unwrap_or(defaults.edge_auth_protected_paths),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?,

            // Rate limiting
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 0)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", 50)?,

            // Gateway
            gateway_route_path: env::var("GATEWAY_ROUTE_PATH")
                .unwrap_or(defaults.gateway_route_path),
            gateway_host: env::var("GATEWAY_HOST").ok().filter(|h| !h.is_empty()),
            gateway_set_path: match env::var("GATEWAY_SET_PATH") {
                Ok(path) if path.is_empty() => None,
                Ok(path) => Some(path),
                Err(_) => defaults.gateway_set_path,
            },
            gateway_allow_origin: match env::var("GATEWAY_ALLOW_ORIGIN") {
                Ok(origin) if origin.is_empty() => None,
                Ok(origin) => Some(origin),
                Err(_) => defaults.gateway_allow_origin,
            },
            gateway_replenish_rate: Self::parse_env("GATEWAY_REPLENISH_RATE", 5)?,
            gateway_burst_capacity: Self::parse_env("GATEWAY_BURST_CAPACITY", 7)?,
            gateway_timeout: Duration::from_secs(Self::parse_env("GATEWAY_TIMEOUT_SECS", 30)?),

            // Edge behaviour
            edge_startup_checks: Self::parse_env("EDGE_STARTUP_CHECKS", false)?,
            check_greeting_name: env::var("CHECK_GREETING_NAME")
                .unwrap_or(defaults.check_greeting_name),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
            edge_metrics_port: Self::parse_env("EDGE_METRICS_PORT", defaults.edge_metrics_port)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.greeting_interval.is_zero() {
            return Err(AppError::ConfigError(
                "GREETING_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        if self.upstream_time_limit.is_zero() {
            return Err(AppError::ConfigError(
                "UPSTREAM_TIME_LIMIT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.upstream_retry_base_delay > self.upstream_retry_max_delay {
            return Err(AppError::ConfigError(format!(
                "UPSTREAM_RETRY_BASE_DELAY_MS ({:?}) must be <= UPSTREAM_RETRY_MAX_DELAY_MS ({:?})",
                self.upstream_retry_base_delay, self.upstream_retry_max_delay
            )));
        }

        if self.rpc_reconnect_base_delay > self.rpc_reconnect_max_delay {
            return Err(AppError::ConfigError(format!(
                "RPC_RECONNECT_BASE_DELAY_MS ({:?}) must be <= RPC_RECONNECT_MAX_DELAY_MS ({:?})",
                self.rpc_reconnect_base_delay, self.rpc_reconnect_max_delay
            )));
        }

        if !(self.reservation_service_url.starts_with("http://")
            || self.reservation_service_url.starts_with("https://"))
        {
            return Err(AppError::ConfigError(format!(
                "RESERVATION_SERVICE_URL must start with http:// or https:// (got {})",
                self.reservation_service_url
            )));
        }

        if !self.gateway_route_path.starts_with('/') {
            return Err(AppError::ConfigError(
                "GATEWAY_ROUTE_PATH must start with '/'".to_string(),
            ));
        }

        if self.gateway_replenish_rate > 0 && self.gateway_burst_capacity == 0 {
            return Err(AppError::ConfigError(
                "GATEWAY_BURST_CAPACITY must be greater than 0 when rate limiting the gateway"
                    .to_string(),
            ));
        }

        if self.upstream_username.is_some() != self.upstream_password.is_some() {
            return Err(AppError::ConfigError(
                "UPSTREAM_USERNAME and UPSTREAM_PASSWORD must be set together".to_string(),
            ));
        }

        if self.rpc_max_frame_bytes == 0 {
            return Err(AppError::ConfigError(
                "RPC_MAX_FRAME_BYTES must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Reservation service HTTP bind address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reservation service RPC bind address.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    /// Edge HTTP bind address.
    pub fn edge_addr(&self) -> String {
        format!("{}:{}", self.host, self.edge_port)
    }

    /// Check if the global rate limiter is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rps > 0
    }

    /// Credentials the edge presents upstream, when configured.
    pub fn upstream_credentials(&self) -> Option<Credentials> {
        match (&self.upstream_username, &self.upstream_password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    /// Service metrics listener address, `None` when disabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        Self::metrics_socket(self.metrics_port)
    }

    /// Edge metrics listener address, `None` when disabled.
    pub fn edge_metrics_addr(&self) -> Option<SocketAddr> {
        Self::metrics_socket(self.edge_metrics_port)
    }

    fn metrics_socket(port: u16) -> Option<SocketAddr> {
        (port > 0).then(|| SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list. `None` when the variable is unset;
    /// an empty variable yields an empty list.
    fn parse_list(name: &str) -> Option<Vec<String>> {
        env::var(name).ok().map(|raw| split_list(&raw))
    }

    /// Parse `AUTH_USERS`, rejecting malformed entries.
    fn parse_users() -> AppResult<Option<Vec<UserAccount>>> {
        let Ok(raw) = env::var("AUTH_USERS") else {
            return Ok(None);
        };

        split_list(&raw)
            .iter()
            .map(|entry| {
                UserAccount::parse(entry).ok_or_else(|| {
                    AppError::ConfigError(format!(
                        "Invalid AUTH_USERS entry '{entry}': expected user:password[:ROLE+ROLE]"
                    ))
                })
            })
            .collect::<AppResult<Vec<_>>>()
            .map(Some)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            rpc_port: 7000,
            edge_port: 8081,
            // Greetings & sample data
            greeting_interval: Duration::from_secs(1),
            seed_sample_data: true,
            sample_reservations: DEFAULT_SAMPLE_RESERVATIONS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            // Upstream
            reservation_service_url: "http://localhost:8080".to_string(),
            greetings_rpc_addr: "localhost:7000".to_string(),
            upstream_username: None,
            upstream_password: None,
            upstream_timeout: Duration::from_secs(5),
            upstream_time_limit: Duration::from_secs(5),
            upstream_retry_max: 10,
            upstream_retry_base_delay: Duration::from_secs(1),
            upstream_retry_max_delay: Duration::from_secs(30),
            // Circuit breaker
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_success_threshold: 2,
            circuit_breaker_open_duration: Duration::from_secs(30),
            // RPC
            rpc_auth_required: false,
            rpc_max_frame_bytes: 1024 * 1024,
            rpc_reconnect_max_attempts: 5,
            rpc_reconnect_base_delay: Duration::from_millis(500),
            rpc_reconnect_max_delay: Duration::from_secs(10),
            // Security
            auth_users: vec![
                UserAccount {
                    username: "jlong".to_string(),
                    password: "pw".to_string(),
                    roles: vec!["USER".to_string()],
                },
                UserAccount {
                    username: "rwinch".to_string(),
                    password: "pw".to_string(),
                    roles: vec!["ADMIN".to_string(), "USER".to_string()],
                },
            ],
            auth_protected_paths: vec![],
            edge_auth_protected_paths: vec!["/proxy".to_string()],
            cors_allowed_origins: vec!["*".to_string()],
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // Rate limiting
            rate_limit_rps: 0,
            rate_limit_burst: 50,
            // Gateway
            gateway_route_path: "/proxy".to_string(),
            gateway_host: None,
            gateway_set_path: Some("/reservations".to_string()),
            gateway_allow_origin: Some("*".to_string()),
            gateway_replenish_rate: 5,
            gateway_burst_capacity: 7,
            gateway_timeout: Duration::from_secs(30),
            // Edge behaviour
            edge_startup_checks: false,
            check_greeting_name: "Jane".to_string(),
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
            edge_metrics_port: 9091,
        }
    }
}
