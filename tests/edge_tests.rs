//! End-to-end tests of the edge against an in-process reservation service.
//!
//! Run with: `cargo test --test edge_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::Value;

use reservation_demo::resilience::CircuitState;

use common::{
    EdgeFixture, ServiceFixture, closed_addr, failing_upstream, next_sse_data, silent_upstream,
};

#[tokio::test]
async fn test_edge_health_and_readiness() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start(&service.base_url, &service.rpc_addr).await;

    // The housekeeping task connects the requester right away
    let requester = edge.state.greetings.requester().clone();
    common::wait_until(move || requester.is_connected()).await;

    let response = edge.client.get(edge.url("/ready")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = edge
        .client
        .get(edge.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rpc_connected"], true);
    assert_eq!(body["circuit_breaker"], "closed");
}

#[tokio::test]
async fn test_edge_not_ready_without_rpc() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start(&service.base_url, &closed_addr().await).await;

    let response = edge.client.get(edge.url("/ready")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_reservation_names() {
    let service = ServiceFixture::start().await;
    service.seed(&["Josh", "Cornelia", "Dr. Syer"]).await;
    let edge = EdgeFixture::start(&service.base_url, &service.rpc_addr).await;

    let response = edge
        .client
        .get(edge.url("/reservations/names"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut names: Vec<String> = response.json().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["Cornelia", "Dr. Syer", "Josh"]);
}

#[tokio::test]
async fn test_reservation_names_fallback_when_service_down() {
    let down = format!("http://{}", closed_addr().await);
    let edge = EdgeFixture::start(&down, &closed_addr().await).await;

    let names: Vec<String> = edge
        .client
        .get(edge.url("/reservations/names"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(names, vec!["EEEK!"]);
}

#[tokio::test]
async fn test_open_breaker_answers_fallback_without_calling_upstream() {
    let (upstream, hits) = failing_upstream().await;
    let edge = EdgeFixture::start_with(&upstream, &closed_addr().await, |config| {
        config.circuit_breaker_failure_threshold = 1;
        config.circuit_breaker_open_duration = Duration::from_secs(60);
    })
    .await;

    let names: Vec<String> = edge
        .client
        .get(edge.url("/reservations/names"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names, vec!["EEEK!"]);
    assert_eq!(edge.state.breaker.state().await, CircuitState::Open);
    let hits_before = hits.load(Ordering::SeqCst);
    assert!(hits_before > 0);

    let response = edge
        .client
        .get(edge.url("/reservations/names"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let names: Vec<String> = response.json().await.unwrap();
    assert_eq!(names, vec!["EEEK!"]);

    assert_eq!(hits.load(Ordering::SeqCst), hits_before);
    assert_eq!(edge.state.breaker.requests_rejected(), 1);
}

#[tokio::test]
async fn test_hung_upstream_answers_fallback_within_time_limit() {
    let upstream = silent_upstream().await;
    let edge = EdgeFixture::start_with(&upstream, &closed_addr().await, |config| {
        config.upstream_time_limit = Duration::from_millis(300);
        config.upstream_timeout = Duration::from_secs(30);
    })
    .await;

    let started = Instant::now();
    let response = edge
        .client
        .get(edge.url("/reservations/names"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let names: Vec<String> = response.json().await.unwrap();

    assert_eq!(names, vec!["EEEK!"]);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_greetings_relayed_over_rpc() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start(&service.base_url, &service.rpc_addr).await;

    let response = edge
        .client
        .get(edge.url("/greetings/Jane"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    for _ in 0..2 {
        let data = next_sse_data(&mut stream, &mut buffer).await;
        let greeting: Value = serde_json::from_str(&data).unwrap();
        assert!(
            greeting["message"]
                .as_str()
                .unwrap()
                .starts_with("Hello Jane @ ")
        );
    }

    // Closing the edge stream cancels the upstream one
    drop(stream);
    let greetings = service.state.greetings.clone();
    common::wait_until(move || greetings.active_streams() == 0).await;
}

#[tokio::test]
async fn test_greetings_unavailable_without_rpc() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start(&service.base_url, &closed_addr().await).await;

    let response = edge
        .client
        .get(edge.url("/greetings/Jane"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Gateway Tests
// ============================================================================

#[tokio::test]
async fn test_proxy_requires_authentication() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start(&service.base_url, &service.rpc_addr).await;

    let response = edge.client.get(edge.url("/proxy")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"reservation_demo\""
    );
}

#[tokio::test]
async fn test_proxy_forwards_to_reservations() {
    let service = ServiceFixture::start().await;
    service.seed(&["Josh", "Olga"]).await;
    let edge = EdgeFixture::start(&service.base_url, &service.rpc_addr).await;

    let response = edge
        .client
        .get(edge.url("/proxy?name=Olga"))
        .basic_auth("jlong", Some("pw"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "6");
    assert_eq!(headers.get("x-ratelimit-replenish-rate").unwrap(), "5");
    assert_eq!(headers.get("x-ratelimit-burst-capacity").unwrap(), "7");

    let reservations: Vec<Value> = response.json().await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0]["name"], "Olga");
}

#[tokio::test]
async fn test_proxy_rate_limit() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start_with(&service.base_url, &service.rpc_addr, |config| {
        config.gateway_replenish_rate = 1;
        config.gateway_burst_capacity = 2;
    })
    .await;

    for _ in 0..2 {
        let response = edge
            .client
            .get(edge.url("/proxy"))
            .basic_auth("jlong", Some("pw"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = edge
        .client
        .get(edge.url("/proxy"))
        .basic_auth("jlong", Some("pw"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");

    // Another principal has its own bucket
    let response = edge
        .client
        .get(edge.url("/proxy"))
        .basic_auth("rwinch", Some("pw"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_proxy_upstream_down_is_bad_gateway() {
    let down = format!("http://{}", closed_addr().await);
    let edge = EdgeFixture::start(&down, &closed_addr().await).await;

    let response = edge
        .client
        .get(edge.url("/proxy"))
        .basic_auth("jlong", Some("pw"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_unrouted_path_is_not_found() {
    let service = ServiceFixture::start().await;
    let edge = EdgeFixture::start(&service.base_url, &service.rpc_addr).await;

    let response = edge.client.get(edge.url("/nowhere")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
