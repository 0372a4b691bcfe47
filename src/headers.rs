//! HTTP header processing for forwarded requests and returned responses.
//!
//! Connection-scoped headers (RFC 7230 Section 6.1) never cross the proxy,
//! and the backend learns the original client through the de-facto
//! `X-Forwarded-*` headers.

use std::net::SocketAddr;

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// Headers that are meaningful only for a single transport hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let declared = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();

    for name in &declared {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Appends the client to `X-Forwarded-For` and records the original
/// protocol and host.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|prior| prior.to_str().ok())
    {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip,
    };

    if let Ok(val) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", val);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
}

/// Points the `Host` header at the backend.
pub fn rewrite_host(headers: &mut HeaderMap, backend: &Authority) {
    if let Ok(val) = HeaderValue::from_str(backend.as_str()) {
        headers.insert(header::HOST, val);
    }
}

/// Returns `true` if a declared `Content-Length` is larger than `max_bytes`.
///
/// Missing or unparseable values return `false`; the body limit is still
/// enforced while buffering.
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .is_some_and(|len| len > max_bytes)
}
