//! Client identification for rate limiting and brute force protection.
//!
//! # Key Priority
//!
//! 1. The authenticated [`Principal`]'s username (set by basic auth)
//! 2. The first address in `X-Forwarded-For`
//! 3. `X-Real-IP`
//! 4. The peer address from `ConnectInfo`, when the server provides it
//! 5. [`UNKNOWN_CLIENT`]
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **Forwarding headers are client-provided.** Behind a reverse proxy that
//! overwrites them this is what you want; exposed directly, a client can
//! rotate `X-Forwarded-For` values to dodge per-IP limits.
//!
//! All requests without any identifying information share the
//! `"unknown"` key and are therefore limited together.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

use crate::models::Principal;

/// Key shared by every request that cannot be attributed to a client.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Extract the client IP from forwarding headers or the peer address.
///
/// Returns `Cow::Borrowed(UNKNOWN_CLIENT)` when nothing identifies the client.
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>) -> Cow<'static, str> {
    // Format: "client, proxy1, proxy2" - we want the first (client) IP
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return Cow::Owned(first_ip.to_string());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return Cow::Owned(value.trim().to_string());
    }

    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Cow::Owned(peer.ip().to_string());
    }

    Cow::Borrowed(UNKNOWN_CLIENT)
}

/// Key identifying the caller: principal name, else client IP.
#[inline]
pub fn client_key<B>(req: &Request<B>) -> Cow<'static, str> {
    match req.extensions().get::<Principal>() {
        Some(principal) => Cow::Owned(principal.username.clone()),
        None => extract_client_ip(req),
    }
}
