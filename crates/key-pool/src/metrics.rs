//! Pool metrics recorded through the `metrics` facade
//!
//! - `key_pool_acquire_total` (counter): labels `pool`, `outcome`
//!   (`ok`, `exhausted`, `unknown_pool`)
//! - `key_pool_reports_total` (counter): labels `pool`, `outcome`
//!   (`success`, `failure`)
//! - `key_pool_disabled_total` (counter): label `pool`
//! - `key_pool_retries_total` (counter): label `pool`
//!
//! Calls are no-ops until the host installs a recorder.

pub(crate) fn record_acquire(pool: &str, outcome: &'static str) {
    metrics::counter!("key_pool_acquire_total", "pool" => pool.to_string(), "outcome" => outcome)
        .increment(1);
}

pub(crate) fn record_report(pool: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("key_pool_reports_total", "pool" => pool.to_string(), "outcome" => outcome)
        .increment(1);
}

pub(crate) fn record_disabled(pool: &str) {
    metrics::counter!("key_pool_disabled_total", "pool" => pool.to_string()).increment(1);
}

pub(crate) fn record_retry(pool: &str) {
    metrics::counter!("key_pool_retries_total", "pool" => pool.to_string()).increment(1);
}
