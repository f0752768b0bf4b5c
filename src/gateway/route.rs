//! Route definitions: predicates deciding which requests a route takes and
//! the filters applied on the way through.

use axum::http::{HeaderName, HeaderValue};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::middleware::PathPattern;

/// Id of the route built from `GATEWAY_*` settings.
pub const RESERVATIONS_PROXY_ROUTE: &str = "reservations-proxy";

/// Host predicate. `*.example.com` matches any subdomain of `example.com`;
/// anything else must match exactly. Case-insensitive; ports are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    pattern: String,
}

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: strip_port(pattern.trim()).to_ascii_lowercase(),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = strip_port(host.trim()).to_ascii_lowercase();

        match self.pattern.strip_prefix('*') {
            // "*.spring.io" -> ".spring.io"
            Some(suffix) if suffix.starts_with('.') => {
                host.len() > suffix.len() && host.ends_with(suffix)
            }
            _ => host == self.pattern,
        }
    }
}

/// `host:port` → `host`, keeping bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host
            .find(']')
            .and_then(|end| host.get(..=end))
            .unwrap_or(host);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Token bucket settings of the `RequestRateLimiter` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    /// Tokens added per second
    pub replenish_rate: u32,
    /// Bucket size
    pub burst_capacity: u32,
}

/// One gateway route.
///
/// # Example
///
/// ```rust,ignore
/// let route = RouteDefinition::new("reservations-proxy", "/proxy", "http://localhost:8080")
///     .host("*.spring.io")
///     .set_path("/reservations")
///     .add_response_header("access-control-allow-origin", "*")?
///     .rate_limit(5, 7);
/// ```
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub id: String,
    pub path: PathPattern,
    pub host: Option<HostPattern>,
    /// Replaces the request path; the query string is kept
    pub set_path: Option<String>,
    pub response_headers: Vec<(HeaderName, HeaderValue)>,
    pub rate_limit: Option<RateLimitSpec>,
    /// Upstream base URI
    pub uri: String,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, path: &str, uri: impl Into<String>) -> Self {
        let uri: String = uri.into();
        Self {
            id: id.into(),
            path: PathPattern::parse(path),
            host: None,
            set_path: None,
            response_headers: Vec::new(),
            rate_limit: None,
            uri: uri.trim_end_matches('/').to_string(),
        }
    }

    pub fn host(mut self, pattern: &str) -> Self {
        self.host = Some(HostPattern::new(pattern));
        self
    }

    pub fn set_path(mut self, path: impl Into<String>) -> Self {
        self.set_path = Some(path.into());
        self
    }

    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for an invalid header name or value.
    pub fn add_response_header(mut self, name: &str, value: &str) -> AppResult<Self> {
        let name = HeaderName::try_from(name)
            .map_err(|e| AppError::ConfigError(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| AppError::ConfigError(format!("Invalid header value '{value}': {e}")))?;
        self.response_headers.push((name, value));
        Ok(self)
    }

    pub fn rate_limit(mut self, replenish_rate: u32, burst_capacity: u32) -> Self {
        self.rate_limit = Some(RateLimitSpec {
            replenish_rate,
            burst_capacity,
        });
        self
    }

    /// Whether this route takes a request for `path` sent to `host`.
    ///
    /// A route with a host predicate never matches a request without a host.
    pub fn matches(&self, path: &str, host: Option<&str>) -> bool {
        if !self.path.matches(path) {
            return false;
        }

        match (&self.host, host) {
            (None, _) => true,
            (Some(pattern), Some(host)) => pattern.matches(host),
            (Some(_), None) => false,
        }
    }

    /// Upstream path for a request to `path`.
    pub fn target_path<'a>(&'a self, path: &'a str) -> &'a str {
        self.set_path.as_deref().unwrap_or(path)
    }

    /// The `reservations-proxy` route from `GATEWAY_*` settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `GATEWAY_ALLOW_ORIGIN` is not a
    /// valid header value.
    pub fn reservations_proxy(config: &Config) -> AppResult<Self> {
        let mut route = RouteDefinition::new(
            RESERVATIONS_PROXY_ROUTE,
            &config.gateway_route_path,
            config.reservation_service_url.as_str(),
        );

        if let Some(host) = &config.gateway_host {
            route = route.host(host);
        }
        if let Some(path) = &config.gateway_set_path {
            route = route.set_path(path.as_str());
        }
        if let Some(origin) = &config.gateway_allow_origin {
            route = route.add_response_header("access-control-allow-origin", origin)?;
        }
        if config.gateway_replenish_rate > 0 {
            route = route.rate_limit(config.gateway_replenish_rate, config.gateway_burst_capacity);
        }

        Ok(route)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_host_glob() {
        let pattern = HostPattern::new("*.spring.io");

        assert!(pattern.matches("start.spring.io"));
        assert!(pattern.matches("Start.Spring.IO:8080"));
        assert!(pattern.matches("a.b.spring.io"));
        assert!(!pattern.matches("spring.io"));
        assert!(!pattern.matches("notspring.io"));
    }

    #[test]
    fn test_exact_host() {
        let pattern = HostPattern::new("localhost");

        assert!(pattern.matches("localhost:8081"));
        assert!(pattern.matches("LOCALHOST"));
        assert!(!pattern.matches("example.com"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("example.com"), "example.com");
    }

    #[test]
    fn test_route_matching() {
        let route = RouteDefinition::new("r", "/proxy/**", "http://upstream").host("*.spring.io");

        assert!(route.matches("/proxy", Some("a.spring.io")));
        assert!(route.matches("/proxy/1", Some("a.spring.io")));
        assert!(!route.matches("/proxy", Some("localhost")));
        assert!(!route.matches("/proxy", None));
        assert!(!route.matches("/other", Some("a.spring.io")));
    }

    #[test]
    fn test_default_route_from_config() {
        let route = RouteDefinition::reservations_proxy(&Config::default()).unwrap();

        assert_eq!(route.id, RESERVATIONS_PROXY_ROUTE);
        assert_eq!(route.path, PathPattern::Exact("/proxy".to_string()));
        assert!(route.host.is_none());
        assert_eq!(route.target_path("/proxy"), "/reservations");
        assert_eq!(route.uri, "http://localhost:8080");
        assert_eq!(
            route.rate_limit,
            Some(RateLimitSpec {
                replenish_rate: 5,
                burst_capacity: 7
            })
        );
        assert_eq!(route.response_headers.len(), 1);
        assert_eq!(route.response_headers[0].0, "access-control-allow-origin");
        assert!(route.matches("/proxy", None));
    }

    #[test]
    fn test_invalid_response_header() {
        let result = RouteDefinition::new("r", "/x", "http://u").add_response_header("bad name", "v");
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
