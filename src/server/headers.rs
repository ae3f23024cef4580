//! Header hygiene in both directions.

use axum::http::{HeaderMap, HeaderValue, header};

/// Player headers never forwarded upstream.
const STRIPPED_REQUEST: [&str; 9] = [
    "cookie",
    "referer",
    "origin",
    "range",
    "user-agent",
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
];

/// Origin headers that would be wrong or harmful once re-served locally.
const STRIPPED_RESPONSE: [&str; 12] = [
    "transfer-encoding",
    "content-encoding",
    "keep-alive",
    "strict-transport-security",
    "content-security-policy",
    "x-xss-protection",
    "cross-origin-resource-policy",
    "content-range",
    "accept-ranges",
    "content-length",
    "connection",
    "set-cookie",
];

/// Headers for the upstream request derived from the player's request.
/// Bodies are always fetched uncompressed.
pub fn upstream_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in STRIPPED_REQUEST {
        headers.remove(name);
    }
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers
}

/// Origin response headers made safe for the player.
pub fn sanitize_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in STRIPPED_RESPONSE {
        headers.remove(name);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers
}
