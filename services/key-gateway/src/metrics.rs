//! Prometheus metrics exposition
//!
//! Gateway metrics:
//!
//! - `gateway_requests_total` (counter): labels `pool`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `pool`
//! - `gateway_upstream_errors_total` (counter): labels `pool`, `error_type`
//!
//! The key-pool library records its own `key_pool_*` counters through the
//! same recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets from 5ms to 60s. Retried calls include backoff sleeps,
/// so the upper buckets matter more than for a plain proxy.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed gateway request.
pub fn record_request(pool: &str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "pool" => pool.to_string(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "pool" => pool.to_string())
        .record(duration_secs);
}

/// Record a failed upstream attempt with a classification label.
pub fn record_upstream_error(pool: &str, error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "pool" => pool.to_string(), "error_type" => error_type.to_string())
        .increment(1);
}
