//! Pooled upstream proxy
//!
//! `/pools/{pool}/{*path}` is forwarded to `upstream_url/{path}` with a bearer
//! credential drawn from the named pool. Hop-by-hop headers, `Host` and any
//! client `Authorization` are stripped first. Credential-level failures are
//! retried by the `RequestExecutor` with another credential; everything else
//! from upstream is returned verbatim, tagged with the serving credential's
//! fingerprint, the attempt number and the upstream latency.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::Response;
use key_pool::RequestExecutor;
use tracing::{error, info, instrument};

use crate::error::GatewayError;
use crate::metrics;

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

/// Redacted credential that served the request.
pub const KEY_FINGERPRINT_HEADER: &str = "x-key-fingerprint";
/// One-based attempt number that succeeded.
pub const ATTEMPT_HEADER: &str = "x-attempt";
/// Upstream time of the successful attempt, in milliseconds.
pub const UPSTREAM_LATENCY_HEADER: &str = "x-upstream-latency-ms";

/// Inbound request body limit.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub executor: RequestExecutor,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// A failed upstream attempt that should count against the credential used.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {0}")]
    Status(u16),
}

impl AttemptError {
    fn label(&self) -> String {
        match self {
            AttemptError::Transport(e) if e.is_timeout() => "timeout".into(),
            AttemptError::Transport(_) => "connection".into(),
            AttemptError::Status(code) => format!("status_{code}"),
        }
    }
}

/// Whether an upstream status means the credential (not the request) failed.
///
/// 401/403 point at a bad key, 429 at an exhausted one, 408/5xx at an upstream
/// hiccup worth retrying elsewhere. Other statuses are the caller's business.
pub fn counts_against_credential(status: u16) -> bool {
    matches!(status, 401 | 403 | 408 | 429 | 500..=599)
}

/// Forward one inbound request through the pool's executor.
#[instrument(skip_all, fields(request_id = %request_id, pool = %pool, method = %request.method()))]
pub async fn proxy_request(
    state: &ProxyState,
    pool: String,
    path: String,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let response = match forward(state, &pool, &path, request).await {
        Ok(response) => response,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            match &e {
                GatewayError::Pool(key_pool::Error::UnknownPool(_)) => {
                    info!(error = %e, "request for unknown pool");
                }
                _ => error!(error = %e, "request failed"),
            }
            e.into_response_with_id(&request_id)
        }
    };

    metrics::record_request(
        &pool,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    pool: &str,
    path: &str,
    request: axum::http::Request<axum::body::Body>,
) -> Result<Response, GatewayError> {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let mut upstream_url = format!(
        "{}/{}",
        state.upstream_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = uri.query() {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_replaced_by_gateway(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::InvalidBody(e.to_string()))?;

    let (reply, used) = state
        .executor
        .execute_with_meta(pool, |credential| {
            let req = state
                .client
                .request(method.clone(), &upstream_url)
                .headers(headers.clone())
                .bearer_auth(&credential)
                .timeout(state.timeout)
                .body(body.clone());
            async move {
                let result = attempt(req).await;
                if let Err(e) = &result {
                    metrics::record_upstream_error(pool, &e.label());
                }
                result
            }
        })
        .await?;

    let mut response = Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .header(KEY_FINGERPRINT_HEADER, used.fingerprint.as_str())
        .header(ATTEMPT_HEADER, used.number)
        .header(UPSTREAM_LATENCY_HEADER, reply.latency.as_millis() as u64)
        .body(axum::body::Body::from(reply.body))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Upstream response accepted by the executor.
struct UpstreamReply {
    status: StatusCode,
    headers: reqwest::header::HeaderMap,
    body: axum::body::Bytes,
    latency: Duration,
}

/// One upstream attempt. Credential-level failures become `Err` so the
/// executor reports them and retries; any other response is a success.
async fn attempt(req: reqwest::RequestBuilder) -> Result<UpstreamReply, AttemptError> {
    let started = Instant::now();
    let upstream = req.send().await?;
    let status = upstream.status();
    if counts_against_credential(status.as_u16()) {
        return Err(AttemptError::Status(status.as_u16()));
    }
    let headers = upstream.headers().clone();
    let body = upstream.bytes().await?;
    Ok(UpstreamReply {
        status,
        headers,
        body,
        latency: started.elapsed(),
    })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers the gateway owns: `Host` comes from the upstream URL and
/// `Authorization` from the pool.
fn is_replaced_by_gateway(name: &str) -> bool {
    name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("authorization")
}
