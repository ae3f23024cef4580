use crate::{
    error::{ProxyError, Result},
    hls::{mirrors::Fallback, rewrite::absolutize},
    metrics,
    multiplexer::{Failure, MediaKind},
    registry::ResourceRequest,
    server::{
        headers::{sanitize_response_headers, upstream_request_headers},
        state::AppState,
    },
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Serve any proxified URL: `/host/path` (http) or `/s/host/path` (https).
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let kind = MediaKind::from_url(uri.path());

    let response = match serve(&state, &method, &path, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };

    metrics::record_request(kind.as_str(), response.status().as_u16());
    metrics::record_duration(kind.as_str(), start);
    response
}

async fn serve(
    state: &AppState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> Result<Response> {
    let bare = path.split('?').next().unwrap_or(path);
    if bare == "/" || bare == "/favicon.ico" {
        return Err(ProxyError::InvalidPath(bare.to_string()));
    }

    let url = state.urls.unproxify_path(path);
    state.urls.validate_upstream(&url)?;
    debug!("{} {}", method, url);

    let request = ResourceRequest::new(url.clone()).with_headers(upstream_request_headers(headers));
    let mut client = state.registry.download(request)?;
    let head = match client.response().await {
        Ok(head) => head,
        Err(failure @ (Failure::Timeout(_) | Failure::Aborted(_))) => {
            warn!("No response for {}: {}", url, failure);
            return Ok(aborted(failure));
        }
        Err(failure) => return Err(failure.into_error(&url)),
    };

    if head.status == 404 && MediaKind::from_url(&url) == MediaKind::Meta {
        match state.registry.mirrors().fallback_for(&url) {
            Fallback::Redirect(mirror) => {
                info!("Redirecting {} to mirror {}", url, mirror);
                return Ok(redirect(StatusCode::MOVED_PERMANENTLY, &state.urls.proxify(&mirror)));
            }
            Fallback::Exhausted => {
                return Ok(empty(StatusCode::NOT_FOUND, sanitize_response_headers(&HeaderMap::new())));
            }
            Fallback::NotMirrored => {}
        }
    }

    let mut status = head.status;
    let mut out_headers = sanitize_response_headers(&head.headers);

    let location = head
        .headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok());
    if let Some(location) = location {
        let target = state.urls.proxify(&absolutize(location, &head.final_url));
        if let Ok(value) = HeaderValue::from_str(&target) {
            out_headers.insert(header::LOCATION, value);
        }
        if !(300..400).contains(&status) {
            status = 307;
        }
    }

    // error bodies are not relayed
    let bodyless = status >= 400;

    // range requests are never forwarded
    if status == 206 {
        status = 200;
    }
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    if *method == Method::HEAD || status == StatusCode::NO_CONTENT || bodyless {
        if bodyless {
            out_headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        return Ok(empty(status, out_headers));
    }

    let mut response = Response::new(Body::from_stream(client.into_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = out_headers;
    Ok(response)
}

fn empty(status: StatusCode, headers: HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// A response whose body fails before its first byte, so the connection is
/// reset without a complete reply reaching the player.
fn aborted(failure: Failure) -> Response {
    let body = stream::once(async move { Err::<Bytes, _>(std::io::Error::other(failure)) });
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

fn redirect(status: StatusCode, location: &str) -> Response {
    let mut headers = sanitize_response_headers(&HeaderMap::new());
    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert(header::LOCATION, value);
    }
    empty(status, headers)
}
