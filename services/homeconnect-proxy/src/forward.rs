//! Authenticated request forwarding
//!
//! Receives inbound requests under `/homeappliances`, strips hop-by-hop
//! headers and any client credentials, injects the current bearer token and
//! forwards to the vendor API. The vendor's response, including error
//! statuses, is returned verbatim. Only failures that never produced a
//! vendor response become proxy error bodies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use homeconnect_auth::TokenManager;
use tracing::{debug, error, instrument, warn};

use crate::metrics::{record_request, record_upstream_error};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest inbound body accepted for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the forwarding handler
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub base_url: String,
    pub tokens: Arc<TokenManager>,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Whether the response should be relayed as a live stream rather than
/// buffered. Only the SSE endpoints qualify.
fn is_event_stream(path: &str) -> bool {
    path.ends_with("/events")
}

/// Forward an inbound request to the vendor API with a valid bearer token.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let streaming = is_event_stream(uri.path());

    let upstream_url = match uri.path_and_query() {
        Some(pq) => format!("{}{}", state.base_url.trim_end_matches('/'), pq),
        None => state.base_url.clone(),
    };

    let token = match state.tokens.get_valid_token().await {
        Ok(t) => t,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            record_upstream_error("token");
            warn!(error = %e, "no valid token for forwarded request");
            let error_type = if e.requires_authorization() {
                "authorization_required"
            } else {
                "token_unavailable"
            };
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                error_type,
                &e.to_string(),
                &request_id,
            );
        }
    };

    let mut headers = forwardable_headers(request.headers());
    let bearer = match HeaderValue::from_str(&format!("Bearer {}", token.access_token)) {
        Ok(v) => v,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "stored access token is not a valid header value");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "token_unavailable",
                "stored access token is malformed",
                &request_id,
            );
        }
    };
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let mut upstream = state
        .client
        .request(method.clone(), &upstream_url)
        .headers(headers)
        .body(body_bytes);
    if !streaming {
        upstream = upstream.timeout(state.timeout);
    }

    let upstream_response = match upstream.send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            record_upstream_error("timeout");
            error!(error = %e, "upstream timeout");
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "proxy_error",
                &format!("upstream timeout after {}s", state.timeout.as_secs()),
                &request_id,
            );
        }
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            record_upstream_error("connection");
            error!(error = %e, "upstream request failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &format!("upstream error: {e}"),
                &request_id,
            );
        }
    };

    let status = upstream_response.status();
    let mut response = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }

    let body = if streaming {
        debug!("relaying event stream");
        Body::from_stream(upstream_response.bytes_stream())
    } else {
        match upstream_response.bytes().await {
            Ok(b) => Body::from(b),
            Err(e) => {
                state.errors_total.fetch_add(1, Ordering::Relaxed);
                record_upstream_error("read");
                error!(error = %e, "failed to read upstream response body");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    "proxy_error",
                    &format!("upstream response read error: {e}"),
                    &request_id,
                );
            }
        }
    };

    record_request(
        status.as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response.body(body).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            &format!("response build error: {e}"),
            &request_id,
        )
    })
}

/// Inbound headers that may travel upstream. The client's own
/// `authorization` is dropped; the proxy's token replaces it.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str())
            || name == HOST
            || name == CONTENT_LENGTH
            || name == AUTHORIZATION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
