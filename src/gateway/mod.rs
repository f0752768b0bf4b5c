//! Reverse proxy of the edge.
//!
//! # Request Flow
//!
//! ```text
//! request ─► first matching route (path, host) ─► RequestRateLimiter
//!         ─► SetPath ─► forward upstream ─► AddResponseHeader ─► response
//! ```
//!
//! Requests no route takes get 404. Routes are tried in definition order.

pub mod proxy;
pub mod route;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::{ClientRateLimiter, client_key};

pub use proxy::{forward, forwarded_headers, strip_hop_by_hop, target_url};
pub use route::{HostPattern, RESERVATIONS_PROXY_ROUTE, RateLimitSpec, RouteDefinition};

struct CompiledRoute {
    definition: RouteDefinition,
    limiter: Option<ClientRateLimiter>,
}

/// Routes plus the HTTP client used to reach their upstreams.
#[derive(Clone)]
pub struct Gateway {
    routes: Arc<Vec<CompiledRoute>>,
    http: reqwest::Client,
}

impl Gateway {
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a route's rate limit is invalid or
    /// the HTTP client cannot be built.
    pub fn new(routes: Vec<RouteDefinition>, timeout: Duration) -> AppResult<Self> {
        let routes = routes
            .into_iter()
            .map(|definition| {
                let limiter = definition
                    .rate_limit
                    .map(|spec| ClientRateLimiter::new(spec.replenish_rate, spec.burst_capacity))
                    .transpose()
                    .map_err(|e| {
                        AppError::ConfigError(format!("route '{}': {e}", definition.id))
                    })?;
                Ok(CompiledRoute {
                    definition,
                    limiter,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        // Redirects go back to the caller
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            routes: Arc::new(routes),
            http,
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteDefinition> {
        self.routes.iter().map(|r| &r.definition)
    }

    /// First route taking a request for `path` sent to `host`.
    pub fn find(&self, path: &str, host: Option<&str>) -> Option<&RouteDefinition> {
        self.find_compiled(path, host).map(|r| &r.definition)
    }

    fn find_compiled(&self, path: &str, host: Option<&str>) -> Option<&CompiledRoute> {
        self.routes
            .iter()
            .find(|r| r.definition.matches(path, host))
    }

    /// Drop idle rate limiter buckets.
    pub fn retain_recent(&self) {
        for limiter in self.routes.iter().filter_map(|r| r.limiter.as_ref()) {
            limiter.retain_recent();
        }
    }

    /// Route `req`, or answer 404 when no route takes it.
    #[instrument(skip(self, req), fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let host = proxy::request_host(&req).map(str::to_string);

        let Some(route) = self.find_compiled(&path, host.as_deref()) else {
            debug!("No gateway route matched");
            return not_found(&path);
        };
        let id = route.definition.id.as_str();

        let decision = match &route.limiter {
            Some(limiter) => {
                let key = client_key(&req);
                let decision = limiter.check(&key);
                if !decision.is_allowed() {
                    warn!(route = id, client = %key, "Gateway rate limit exceeded");
                    metrics::record_rate_limited(id);
                    metrics::record_gateway_request(id, StatusCode::TOO_MANY_REQUESTS.as_u16());
                    return limiter.too_many_requests(decision);
                }
                Some(decision)
            }
            None => None,
        };

        let url = target_url(
            &route.definition.uri,
            route.definition.target_path(&path),
            req.uri().query(),
        );

        let started = Instant::now();
        let mut response = match forward(&self.http, req, url).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
        metrics::record_proxy_duration(id, started.elapsed().as_secs_f64());
        metrics::record_gateway_request(id, response.status().as_u16());

        let headers = response.headers_mut();
        for (name, value) in &route.definition.response_headers {
            headers.insert(name.clone(), value.clone());
        }
        if let (Some(limiter), Some(decision)) = (&route.limiter, decision) {
            limiter.apply_headers(decision, headers);
        }

        response
    }
}

fn not_found(path: &str) -> Response<Body> {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "message": format!("No route for {path}"),
        })),
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{OriginalUri, RawQuery};
    use axum::http::HeaderMap;
    use axum::response::Redirect;
    use axum::routing::get;
    use tokio::net::TcpListener;

    async fn upstream() -> String {
        let router = Router::new().route(
            "/reservations",
            get(|RawQuery(query): RawQuery, headers: HeaderMap| async move {
                let forwarded = headers
                    .get("x-forwarded-host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"query": query, "forwarded_host": forwarded}))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("host", "edge.local")
            .header("x-real-ip", "10.9.9.9")
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_with_set_path_and_headers() {
        let route = RouteDefinition::new("r", "/proxy", upstream().await)
            .set_path("/reservations")
            .add_response_header("access-control-allow-origin", "*")
            .unwrap()
            .rate_limit(5, 7);
        let gateway = Gateway::new(vec![route], Duration::from_secs(5)).unwrap();

        let response = gateway.handle(request("/proxy?name=Josh")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "6");
        assert_eq!(headers.get("x-ratelimit-burst-capacity").unwrap(), "7");

        let body = json_body(response).await;
        assert_eq!(body["query"], "name=Josh");
        assert_eq!(body["forwarded_host"], "edge.local");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_after_burst() {
        let route = RouteDefinition::new("r", "/proxy", upstream().await)
            .set_path("/reservations")
            .rate_limit(1, 2);
        let gateway = Gateway::new(vec![route], Duration::from_secs(5)).unwrap();

        assert_eq!(gateway.handle(request("/proxy")).await.status(), StatusCode::OK);
        assert_eq!(gateway.handle(request("/proxy")).await.status(), StatusCode::OK);

        let response = gateway.handle(request("/proxy")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert!(response.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_upstream_redirect_is_passed_through() {
        let router = Router::new()
            .route("/old", get(|| async { Redirect::temporary("/reservations") }))
            .route("/reservations", get(|| async { "followed" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let route = RouteDefinition::new("r", "/proxy", url).set_path("/old");
        let gateway = Gateway::new(vec![route], Duration::from_secs(5)).unwrap();

        let response = gateway.handle(request("/proxy")).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers().get("location").unwrap(), "/reservations");
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let route = RouteDefinition::new("r", "/proxy", "http://127.0.0.1:9");
        let gateway = Gateway::new(vec![route], Duration::from_secs(5)).unwrap();

        let response = gateway.handle(request("/elsewhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let gateway =
            Gateway::new(vec![RouteDefinition::new("r", "/proxy", url)], Duration::from_secs(5))
                .unwrap();

        let response = gateway.handle(request("/proxy")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_slow_upstream_is_504() {
        let router = Router::new().route(
            "/proxy",
            get(|_: OriginalUri| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "late"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let gateway = Gateway::new(
            vec![RouteDefinition::new("r", "/proxy", url)],
            Duration::from_millis(100),
        )
        .unwrap();

        let response = gateway.handle(request("/proxy")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
