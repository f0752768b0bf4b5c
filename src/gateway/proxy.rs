//! Request forwarding.
//!
//! Bodies are streamed in both directions; nothing is buffered beyond what
//! hyper itself holds.

use std::net::SocketAddr;

use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header};
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Headers meaningful only for a single connection (RFC 9110 §7.6.1).
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// Headers to send upstream: the client's minus hop-by-hop and `Host`, plus
/// `X-Forwarded-*`.
pub fn forwarded_headers<B>(req: &Request<B>) -> HeaderMap {
    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let prior = req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let forwarded_for = match (prior, peer) {
        (Some(prior), Some(peer)) => Some(format!("{prior}, {peer}")),
        (Some(prior), None) => Some(prior.to_string()),
        (None, Some(peer)) => Some(peer),
        (None, None) => None,
    };
    if let Some(value) = forwarded_for.and_then(|v| HeaderValue::try_from(v).ok()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = request_host(req)
        && let Ok(value) = HeaderValue::try_from(host)
    {
        headers.insert(X_FORWARDED_HOST, value);
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        let proto = req.uri().scheme_str().unwrap_or("http");
        if let Ok(value) = HeaderValue::try_from(proto) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }

    headers
}

/// Host the client addressed: `Host` header, else the URI authority.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
}

/// Upstream URL for `path` (query string appended as-is).
pub fn target_url(base: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{base}{path}?{query}"),
        _ => format!("{base}{path}"),
    }
}

/// Send `req` to `url` and stream the upstream response back.
///
/// # Errors
///
/// - `AppError::OperationTimeout` if the upstream does not answer in time (504)
/// - `AppError::Upstream` if it cannot be reached (502)
pub async fn forward(
    http: &reqwest::Client,
    req: Request<Body>,
    url: String,
) -> AppResult<Response<Body>> {
    let headers = forwarded_headers(&req);
    let method = req.method().clone();
    let body = req.into_body();

    debug!(%method, %url, "Forwarding request upstream");

    let mut upstream = http.request(method, &url).headers(headers);
    if body.size_hint().exact() != Some(0) {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let response = upstream.send().await.map_err(|e| {
        if e.is_timeout() {
            AppError::OperationTimeout(format!("upstream {url} timed out"))
        } else {
            AppError::Upstream(format!("upstream {url} unreachable: {e}"))
        }
    })?;

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut proxied = Response::new(Body::from_stream(response.bytes_stream()));
    *proxied.status_mut() = status;
    *proxied.headers_mut() = headers;

    Ok(proxied)
}
