//! Key Gateway
//!
//! Single-binary service that:
//! 1. Loads named credential pools from env vars / key files
//! 2. Forwards `/pools/{pool}/...` requests upstream with a pooled bearer key
//! 3. Retries credential failures with another key, cooling down bad keys
//! 4. Exposes redacted key statistics on a separate admin listener

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use key_pool::{KeyPoolManager, RequestExecutor};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the public axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/pools/{pool}/{*path}", any(proxy_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        upstream_url = %config.server.upstream_url,
        pools = config.pools.len(),
        error_threshold = config.health.error_threshold,
        cooldown_secs = config.health.cooldown_secs,
        max_attempts = config.retry.max_attempts,
        "configuration loaded"
    );

    let manager = Arc::new(KeyPoolManager::new(config.health.policy()));
    manager.initialize(config.pools.iter().map(|pool| {
        let credentials: Vec<String> = pool
            .credentials
            .iter()
            .map(|c| c.expose().clone())
            .collect();
        (pool.name.clone(), credentials)
    }));
    let executor = RequestExecutor::new(manager.clone(), config.retry.policy());

    let proxy_state = ProxyState {
        client: reqwest::Client::new(),
        upstream_url: config.server.upstream_url.clone(),
        timeout: Duration::from_secs(config.server.timeout_secs),
        executor,
        requests_total: Arc::new(AtomicU64::new(0)),
        errors_total: Arc::new(AtomicU64::new(0)),
    };

    let app_state = AppState {
        proxy: proxy_state,
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);
    let admin_app = admin::build_admin_router(AdminState::new(manager));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_listen_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind admin listener to {}",
                config.server.admin_listen_addr
            )
        })?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_listen_addr,
        "accepting requests"
    );

    // Both listeners drain on the same signal; DRAIN_TIMEOUT starts at signal receipt.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(serve(listener, app, shutdown_rx.clone()));
    let admin_handle = tokio::spawn(serve(admin_listener, admin_app, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, async {
        tokio::join!(server_handle, admin_handle)
    })
    .await
    {
        Ok((public, admin)) => {
            for (name, result) in [("public", public), ("admin", admin)] {
                match result {
                    Ok(Ok(())) => info!(listener = name, "listener drained"),
                    Ok(Err(e)) => error!(listener = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Serve `app` until the shutdown flag flips.
async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Health endpoint: service counters plus per-pool availability.
///
/// Returns 200 while every pool has an eligible credential (healthy or
/// degraded) and 503 once any pool is fully cooling down. Credential
/// fingerprints stay on the admin listener.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.proxy.requests_total.load(Ordering::Relaxed);
    let errors = state.proxy.errors_total.load(Ordering::Relaxed);

    let mut health = state.proxy.executor.manager().health();
    let status = health["status"].as_str().unwrap_or("unhealthy").to_string();
    if let Some(pools) = health["pools"].as_object_mut() {
        for pool in pools.values_mut() {
            if let Some(pool) = pool.as_object_mut() {
                pool.remove("credentials");
            }
        }
    }

    let status_code = if status == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "pools": health["pools"],
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Forward `/pools/{pool}/{*path}` upstream with a credential from `pool`.
async fn proxy_handler(
    State(state): State<AppState>,
    Path((pool, path)): Path<(String, String)>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, pool, path, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use key_pool::{HealthPolicy, ManualClock, RetryPolicy};
    use tower::ServiceExt;

    const GOOD_KEY: &str = "gsk_good_0123456789abcdef";
    const THROTTLED_KEY: &str = "gsk_throttled_0123456789";
    const REVOKED_KEY: &str = "gsk_revoked_0123456789ab";

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Build test app state with the given pools, a manual clock and 1ms backoff.
    fn test_app_state(
        upstream_url: &str,
        pools: Vec<(&str, Vec<&str>)>,
        error_threshold: u32,
    ) -> AppState {
        let manager = KeyPoolManager::with_clock(
            HealthPolicy {
                error_threshold,
                cooldown: Duration::from_secs(300),
            },
            Arc::new(ManualClock::new()),
        );
        manager.initialize(pools);
        let executor = RequestExecutor::new(
            Arc::new(manager),
            RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        );

        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                timeout: Duration::from_secs(5),
                executor,
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
            },
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        }
    }

    /// Mock upstream: 429 for throttled keys, 401 for revoked keys, 400 for
    /// `/bad-request`, otherwise echoes the request as JSON.
    async fn start_mock_upstream() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = Router::new().fallback(|request: Request<Body>| async move {
                let authorization = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let tags: Vec<String> = request
                    .headers()
                    .get_all("x-tag")
                    .iter()
                    .filter_map(|v| v.to_str().ok().map(str::to_string))
                    .collect();
                let method = request.method().to_string();
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or("").to_string();
                let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                    .await
                    .unwrap();
                let body_str = String::from_utf8_lossy(&body_bytes).to_string();

                if authorization.contains("throttled") {
                    return (
                        StatusCode::TOO_MANY_REQUESTS,
                        axum::Json(serde_json::json!({"error": "rate limited"})),
                    )
                        .into_response();
                }
                if authorization.contains("revoked") {
                    return (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({"error": "invalid api key"})),
                    )
                        .into_response();
                }
                if path.ends_with("/bad-request") {
                    return (
                        StatusCode::BAD_REQUEST,
                        axum::Json(serde_json::json!({"error": "missing model"})),
                    )
                        .into_response();
                }

                (
                    StatusCode::OK,
                    [("x-upstream-echo", "true")],
                    axum::Json(serde_json::json!({
                        "authorization": authorization,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": body_str,
                        "tags": tags,
                    })),
                )
                    .into_response()
            });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, _, json) = send_with_headers(app, request).await;
        (status, json)
    }

    async fn send_with_headers(
        app: Router,
        request: Request<Body>,
    ) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, headers, json)
    }

    fn header<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> &'a str {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state(
            "http://unused",
            vec![("retrieval", vec![GOOD_KEY]), ("sql-generation", vec![GOOD_KEY])],
            3,
        );
        state.proxy.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let (status, json) = send(
            app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());
        assert_eq!(json["pools"]["retrieval"]["credentials_total"], 1);
        assert!(
            json["pools"]["retrieval"].get("credentials").is_none(),
            "public health must not list credential fingerprints"
        );
    }

    #[tokio::test]
    async fn health_endpoint_returns_503_when_a_pool_is_exhausted() {
        let state = test_app_state(
            "http://unused",
            vec![("retrieval", vec![GOOD_KEY]), ("summarization", vec![REVOKED_KEY])],
            3,
        );
        let manager = state.proxy.executor.manager().clone();
        for _ in 0..3 {
            manager.report("summarization", REVOKED_KEY, false);
        }

        let app = build_router(state, 1000);
        let (status, json) = send(
            app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["pools"]["summarization"]["status"], "unhealthy");
        assert_eq!(json["pools"]["retrieval"]["status"], "healthy");
    }

    #[tokio::test]
    async fn proxy_forwards_with_pool_credential() {
        let (upstream_url, _server) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, vec![("retrieval", vec![GOOD_KEY])], 3);
        let app = build_router(state, 1000);

        let mut request = post(
            "/pools/retrieval/v1/chat/completions?stream=false",
            r#"{"model":"llama3-70b-8192"}"#,
        );
        request.headers_mut().insert(
            "authorization",
            "Bearer client-supplied-token".parse().unwrap(),
        );

        let (status, json) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["authorization"], format!("Bearer {GOOD_KEY}"));
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/v1/chat/completions");
        assert_eq!(json["query"], "stream=false");
        assert_eq!(json["body"], r#"{"model":"llama3-70b-8192"}"#);
    }

    #[tokio::test]
    async fn proxy_retries_with_another_credential() {
        let (upstream_url, _server) = start_mock_upstream().await;
        // Threshold 1: a throttled key is disabled on its first failure, so the
        // next attempt must land on the good key.
        let state = test_app_state(
            &upstream_url,
            vec![("retrieval", vec![THROTTLED_KEY, GOOD_KEY])],
            1,
        );
        let manager = state.proxy.executor.manager().clone();
        let app = build_router(state, 1000);

        let (status, headers, json) =
            send_with_headers(app.clone(), post("/pools/retrieval/v1/x", "{}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["authorization"], format!("Bearer {GOOD_KEY}"));
        assert_eq!(header(&headers, "x-key-fingerprint"), "****abcdef");
        assert!(header(&headers, "x-upstream-latency-ms").parse::<u64>().is_ok());
        // The first pick is random: a throttled first pick means the good key served attempt 2
        let throttled_tried = manager.stats()["retrieval"][THROTTLED_KEY].last_used.is_some();
        let expected_attempt = if throttled_tried { "2" } else { "1" };
        assert_eq!(header(&headers, "x-attempt"), expected_attempt);

        for _ in 0..4 {
            let (status, headers, json) =
                send_with_headers(app.clone(), post("/pools/retrieval/v1/x", "{}")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["authorization"], format!("Bearer {GOOD_KEY}"));
            if throttled_tried {
                assert_eq!(header(&headers, "x-attempt"), "1");
            }
        }

        let stats = manager.stats();
        assert_eq!(stats["retrieval"][GOOD_KEY].consecutive_successes, 5);
        assert_eq!(stats["retrieval"][GOOD_KEY].consecutive_errors, 0);
    }

    #[tokio::test]
    async fn proxy_forwards_repeated_request_headers() {
        let (upstream_url, _server) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, vec![("retrieval", vec![GOOD_KEY])], 3);
        let app = build_router(state, 1000);

        let mut request = post("/pools/retrieval/v1/x", "{}");
        request.headers_mut().append("x-tag", "rag".parse().unwrap());
        request.headers_mut().append("x-tag", "eval".parse().unwrap());

        let (status, headers, json) = send_with_headers(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tags"], serde_json::json!(["rag", "eval"]));
        assert_eq!(header(&headers, "x-attempt"), "1");
    }

    #[tokio::test]
    async fn proxy_returns_503_when_every_attempt_fails() {
        let (upstream_url, _server) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, vec![("retrieval", vec![REVOKED_KEY])], 3);
        let manager = state.proxy.executor.manager().clone();
        let errors_total = state.proxy.errors_total.clone();
        let app = build_router(state, 1000);

        let (status, json) = send(app.clone(), post("/pools/retrieval/v1/x", "{}")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "retries_exhausted");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("try again later")
        );
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );

        let status_after = &manager.stats()["retrieval"][REVOKED_KEY];
        assert_eq!(status_after.consecutive_errors, 3);
        assert!(status_after.disabled_until.is_some());

        // The key is now cooling down: fail fast without touching upstream
        let (status, json) = send(app, post("/pools/retrieval/v1/x", "{}")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert_eq!(errors_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn proxy_unknown_pool_returns_404() {
        let state = test_app_state("http://unused", vec![("retrieval", vec![GOOD_KEY])], 3);
        let app = build_router(state, 1000);

        let (status, json) = send(app, post("/pools/nope/v1/x", "{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["type"], "unknown_pool");
    }

    #[tokio::test]
    async fn proxy_passes_through_client_errors_as_success() {
        let (upstream_url, _server) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, vec![("sql-generation", vec![GOOD_KEY])], 3);
        let manager = state.proxy.executor.manager().clone();
        let app = build_router(state, 1000);

        let (status, json) = send(app, post("/pools/sql-generation/bad-request", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "missing model");

        let key_status = &manager.stats()["sql-generation"][GOOD_KEY];
        assert_eq!(key_status.consecutive_successes, 1);
        assert_eq!(key_status.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn proxy_returns_503_for_dead_upstream() {
        let state = test_app_state("http://127.0.0.1:1", vec![("retrieval", vec![GOOD_KEY])], 10);
        let errors_total = state.proxy.errors_total.clone();
        let app = build_router(state, 1000);

        let (status, json) = send(app, post("/pools/retrieval/v1/x", "{}")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "retries_exhausted");
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn proxy_rejects_oversized_request_body() {
        let state = test_app_state("http://unused", vec![("retrieval", vec![GOOD_KEY])], 3);
        let manager = state.proxy.executor.manager().clone();
        let app = build_router(state, 1000);

        let oversized = vec![b'x'; 10 * 1024 * 1024 + 1];
        let request = Request::builder()
            .uri("/pools/retrieval/v1/x")
            .method("POST")
            .body(Body::from(oversized))
            .unwrap();

        let (status, json) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");
        assert!(
            manager.stats()["retrieval"][GOOD_KEY].last_used.is_none(),
            "no credential should be drawn for a rejected body"
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_contains_metric_names_after_request() {
        // Only one global recorder can exist per process, so install it once.
        use std::sync::OnceLock;
        static GLOBAL_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

        let handle = GLOBAL_HANDLE
            .get_or_init(|| {
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .install_recorder()
                    .expect("failed to install test Prometheus recorder")
            })
            .clone();

        let (upstream_url, _server) = start_mock_upstream().await;
        let mut state = test_app_state(&upstream_url, vec![("retrieval", vec![GOOD_KEY])], 3);
        state.prometheus = handle;
        let app = build_router(state, 1000);

        let (status, _) = send(app.clone(), post("/pools/retrieval/v1/x", "{}")).await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let rendered = String::from_utf8(body.to_vec()).unwrap();

        for name in [
            "gateway_requests_total",
            "gateway_request_duration_seconds",
            "key_pool_acquire_total",
            "key_pool_reports_total",
        ] {
            assert!(
                rendered.contains(name),
                "/metrics must contain {name}.\nRendered:\n{rendered}"
            );
        }
    }
}
