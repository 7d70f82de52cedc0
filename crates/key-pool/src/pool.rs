//! Named credential pools with random selection and error-threshold cooldowns
//!
//! All pools live behind a single `Mutex`. Selection, counter updates and
//! disable-time writes each take the lock once and never hold it across an
//! outbound call, so callers observe either the old or the new status of a
//! credential, never a half-written one.
//!
//! Cooldown transitions happen lazily: when a cooling credential is touched by
//! `acquire` or `report` after its `disabled_until` has passed, it returns to
//! rotation with `consecutive_errors` reset to zero.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use common::redact;
use rand::RngExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::metrics;

/// Consecutive failures before a credential cools down.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// How long a credential sits out after crossing the threshold.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// When credentials get pulled out of rotation, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub error_threshold: u32,
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Health bookkeeping for one credential in one pool.
///
/// `consecutive_errors` and `consecutive_successes` are never both non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialStatus {
    pub last_used: Option<Instant>,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub disabled_until: Option<Instant>,
}

impl CredentialStatus {
    /// Eligible when no cooldown is set or the cooldown has run out.
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.disabled_until.is_none_or(|until| now >= until)
    }

    /// Clear an elapsed cooldown. Returns true if one was cleared.
    fn expire_cooldown(&mut self, now: Instant) -> bool {
        match self.disabled_until {
            Some(until) if now >= until => {
                self.disabled_until = None;
                self.consecutive_errors = 0;
                true
            }
            _ => false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_errors = 0;
    }

    /// Record a failure. Returns true if this failure started a cooldown.
    ///
    /// An active cooldown is never extended by further failures.
    fn record_failure(&mut self, now: Instant, policy: &HealthPolicy) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.consecutive_successes = 0;

        if self.disabled_until.is_some() {
            return false;
        }
        if self.consecutive_errors >= policy.error_threshold.max(1) {
            self.disabled_until = Some(now + policy.cooldown);
            return true;
        }
        false
    }
}

/// Operator-facing view of a credential with the secret reduced to a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSnapshot {
    pub credential: String,
    pub status: &'static str,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_secs_ago: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
}

impl CredentialSnapshot {
    fn new(credential: &str, status: &CredentialStatus, now: Instant) -> Self {
        let cooldown_remaining_secs = status
            .disabled_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_secs());
        Self {
            credential: redact(credential),
            status: if cooldown_remaining_secs.is_some() {
                "cooling_down"
            } else {
                "available"
            },
            consecutive_errors: status.consecutive_errors,
            consecutive_successes: status.consecutive_successes,
            last_used_secs_ago: status
                .last_used
                .map(|at| now.saturating_duration_since(at).as_secs()),
            cooldown_remaining_secs,
        }
    }
}

type Pools = HashMap<String, HashMap<String, CredentialStatus>>;

/// Thread-safe manager for named credential pools.
///
/// Constructed once by the host application and shared via `Arc`. Pools are
/// fully independent: the same secret configured in two pools is tracked
/// separately in each.
pub struct KeyPoolManager {
    pools: Mutex<Pools>,
    policy: HealthPolicy,
    clock: Arc<dyn Clock>,
}

impl KeyPoolManager {
    /// Create an empty manager backed by the system clock.
    pub fn new(policy: HealthPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create an empty manager with an injected time source.
    pub fn with_clock(policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Replace all pools with freshly seeded credentials.
    ///
    /// Every credential starts eligible with zeroed counters. Calling this
    /// again discards prior state rather than merging into it. Empty strings
    /// are skipped; duplicates within a pool collapse into one entry.
    pub fn initialize<I, P, C, K>(&self, pools: I)
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let seeded: Pools = pools
            .into_iter()
            .map(|(name, credentials)| {
                let statuses = credentials
                    .into_iter()
                    .map(Into::into)
                    .filter(|c: &String| !c.is_empty())
                    .map(|c| (c, CredentialStatus::default()))
                    .collect::<HashMap<_, _>>();
                (name.into(), statuses)
            })
            .collect();

        for (name, statuses) in &seeded {
            info!(pool = %name, credentials = statuses.len(), "pool initialized");
        }

        *self.lock() = seeded;
    }

    /// Pick a random eligible credential from `pool` and stamp its `last_used`.
    ///
    /// Never returns a credential that is cooling down. Fails with
    /// `UnknownPool` for unregistered names and `PoolExhausted` when nothing
    /// is eligible; neither case waits or retries.
    pub fn acquire(&self, pool: &str) -> Result<String> {
        let mut pools = self.lock();
        let now = self.clock.now();
        let Some(credentials) = pools.get_mut(pool) else {
            metrics::record_acquire(pool, "unknown_pool");
            return Err(Error::UnknownPool(pool.to_string()));
        };

        for (credential, status) in credentials.iter_mut() {
            if status.expire_cooldown(now) {
                info!(pool, credential = %redact(credential), "cooldown expired, credential back in rotation");
            }
        }

        let eligible: Vec<&String> = credentials
            .iter()
            .filter(|(_, status)| status.is_eligible(now))
            .map(|(credential, _)| credential)
            .collect();

        if eligible.is_empty() {
            metrics::record_acquire(pool, "exhausted");
            return Err(Error::PoolExhausted {
                pool: pool.to_string(),
                total: credentials.len(),
                cooling_down: credentials.len(),
            });
        }

        let chosen = eligible[rand::rng().random_range(0..eligible.len())].clone();
        if let Some(status) = credentials.get_mut(&chosen) {
            status.last_used = Some(now);
        }
        metrics::record_acquire(pool, "ok");
        Ok(chosen)
    }

    /// Record the outcome of a call made with `credential`.
    ///
    /// Never fails: unknown pools or credentials are ignored so bookkeeping
    /// cannot mask the real outcome of the external call.
    pub fn report(&self, pool: &str, credential: &str, success: bool) {
        let mut pools = self.lock();
        let now = self.clock.now();
        let Some(status) = pools
            .get_mut(pool)
            .and_then(|credentials| credentials.get_mut(credential))
        else {
            debug!(pool, credential = %redact(credential), "report for unknown credential ignored");
            return;
        };

        if status.expire_cooldown(now) {
            info!(pool, credential = %redact(credential), "cooldown expired, credential back in rotation");
        }

        metrics::record_report(pool, success);
        if success {
            status.record_success();
            return;
        }

        if status.record_failure(now, &self.policy) {
            metrics::record_disabled(pool);
            warn!(
                pool,
                credential = %redact(credential),
                consecutive_errors = status.consecutive_errors,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "credential disabled after consecutive errors"
            );
        }
    }

    /// Snapshot of every credential's status, keyed by pool then raw credential.
    ///
    /// Contains secrets in full. Operator surfaces should use
    /// [`KeyPoolManager::stats_redacted`] instead.
    pub fn stats(&self) -> HashMap<String, HashMap<String, CredentialStatus>> {
        self.lock().clone()
    }

    /// Snapshot of every credential with secrets reduced to fingerprints.
    ///
    /// Pools are ordered by name; credentials within a pool by fingerprint.
    pub fn stats_redacted(&self) -> BTreeMap<String, Vec<CredentialSnapshot>> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .map(|(name, credentials)| {
                let mut snapshots: Vec<CredentialSnapshot> = credentials
                    .iter()
                    .map(|(credential, status)| CredentialSnapshot::new(credential, status, now))
                    .collect();
                snapshots.sort_by(|a, b| a.credential.cmp(&b.credential));
                (name.clone(), snapshots)
            })
            .collect()
    }

    /// Registered pool names, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Pool health summary for health endpoints.
    ///
    /// Per pool: all credentials eligible → healthy, some → degraded,
    /// none → unhealthy. The overall status is the worst pool status, and
    /// unhealthy when no pools are registered.
    pub fn health(&self) -> serde_json::Value {
        let mut pools = serde_json::Map::new();
        let mut any_degraded = false;
        let mut any_unhealthy = false;

        for (name, credentials) in self.stats_redacted() {
            let total = credentials.len();
            let cooling = credentials
                .iter()
                .filter(|c| c.cooldown_remaining_secs.is_some())
                .count();
            let available = total - cooling;

            let status = if available == total && total > 0 {
                "healthy"
            } else if available > 0 {
                any_degraded = true;
                "degraded"
            } else {
                any_unhealthy = true;
                "unhealthy"
            };

            let entries: Vec<serde_json::Value> = credentials
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "credential": c.credential,
                        "status": c.status,
                        "cooldown_remaining_secs": c.cooldown_remaining_secs.unwrap_or(0),
                    })
                })
                .collect();

            pools.insert(
                name,
                serde_json::json!({
                    "status": status,
                    "credentials_total": total,
                    "credentials_available": available,
                    "credentials_cooling_down": cooling,
                    "credentials": entries,
                }),
            );
        }

        let overall = if pools.is_empty() || any_unhealthy {
            "unhealthy"
        } else if any_degraded {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": overall,
            "pools": pools,
        })
    }

    /// Lock the pool map, recovering from poisoning so `report` stays infallible.
    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
