//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets/propagates X-Request-Id (UUIDv4)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Basic Auth     │ ← 401 on protected paths, Principal otherwise
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded (optional)
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! Reservation service:
//! - `/health`, `/ready`, `/stats` - Health & monitoring
//! - `/reservations` - Reservation CRUD
//! - `/sse/greetings/{name}`, `/ws/greetings` - Greeting streams
//!
//! Edge:
//! - `/health`, `/ready` - Health & monitoring
//! - `/greetings/{name}` - Greetings relayed over RPC
//! - `/reservations/names` - Reservation names with fallback
//! - anything else - Gateway

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

use crate::config::Config;
use crate::handlers;
use crate::middleware::ClientGuards;
use crate::state::{AppState, EdgeState};

/// Build the reservation service router.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/stats", get(handlers::stats))
        .route(
            "/reservations",
            get(handlers::list_reservations).post(handlers::create_reservation),
        )
        .route("/reservations/batch", post(handlers::create_batch))
        .route(
            "/reservations/{id}",
            get(handlers::get_reservation).delete(handlers::delete_reservation),
        )
        .route("/sse/greetings/{name}", get(handlers::sse_greetings))
        .route("/ws/greetings", get(handlers::ws_greetings));

    let router = apply_middleware(router, &state.config, &state.guards);

    router.with_state(state)
}

/// Build the edge router. Requests no route takes go to the gateway.
pub fn build_edge_router(state: EdgeState) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::edge_health_check))
        .route("/ready", get(handlers::edge_readiness_check))
        .route("/greetings/{name}", get(handlers::edge_greetings))
        .route("/reservations/names", get(handlers::reservation_names))
        .fallback(handlers::gateway);

    let router = apply_middleware(router, &state.config, &state.guards);

    router.with_state(state)
}

/// Layers shared by both routers (order matters - applied bottom to top).
fn apply_middleware<S>(mut router: Router<S>, config: &Config, guards: &ClientGuards) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    // 1. Request body size limit
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Rate limiting (if enabled), inside auth so principals are known
    if let Some(rate_limit) = &guards.rate_limit {
        info!(
            rps = config.rate_limit_rps,
            burst = config.rate_limit_burst,
            "Rate limiting enabled"
        );
        router = router.layer(rate_limit.clone());
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_RPS=0)");
    }

    // 3. Basic authentication; always installed so credentials, when sent,
    //    are checked and the principal is available downstream
    if guards.auth.is_enforcing() {
        info!(paths = ?guards.auth.protected_paths(), "Basic authentication enforced");
    } else {
        info!("No protected paths, authentication optional");
    }
    router = router.layer(guards.auth.clone());

    // 4. CORS
    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    // 5. Request ID and tracing
    router = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    router
}

fn make_span(req: &Request<Body>) -> Span {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    info_span!(
        "http_request",
        method = %req.method(),
        uri = %req.uri(),
        request_id,
    )
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let state = AppState::new(Config::default());
        let app = build_router(state.clone());

        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get("x-request-id").unwrap();
        assert_eq!(id.to_str().unwrap().len(), 36);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let state = AppState::new(Config::default());
        let app = build_router(state.clone());

        let response = app
            .oneshot(
                Request::get("/ready")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");

        state.shutdown().await;
    }
}
