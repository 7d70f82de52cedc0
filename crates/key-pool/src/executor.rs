//! Retried execution of a unit of work against a credential pool
//!
//! One call to [`RequestExecutor::execute`] runs acquire → work → report up to
//! `max_attempts` times, drawing a fresh random credential each attempt and
//! sleeping `backoff_base * 2^attempt` between attempts. Every attempt is
//! reported so pool health stays accurate whatever the final outcome.
//!
//! The unit of work runs outside the manager's lock. Dropping the returned
//! future cancels the call, including any pending backoff sleep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::redact;
use tracing::{debug, warn};

use crate::error::{BoxError, Error, Result};
use crate::metrics;
use crate::pool::KeyPoolManager;

/// Attempts per `execute` call unless overridden.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff unit; the delay after failed attempt `n` is this times `2^n`.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Delay after the zero-indexed failed `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

/// The attempt that produced a successful result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// One-based attempt number.
    pub number: u32,
    /// Redacted form of the credential used.
    pub fingerprint: String,
}

/// Composes credential acquisition, invocation and reporting with retries.
#[derive(Clone)]
pub struct RequestExecutor {
    manager: Arc<KeyPoolManager>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(manager: Arc<KeyPoolManager>, policy: RetryPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn manager(&self) -> &Arc<KeyPoolManager> {
        &self.manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` with the policy's default attempt budget.
    pub async fn execute<T, E, F, Fut>(&self, pool: &str, work: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute_with_attempts(pool, self.policy.max_attempts, work)
            .await
    }

    /// Like [`execute`](Self::execute), also returning which attempt succeeded.
    pub async fn execute_with_meta<T, E, F, Fut>(
        &self,
        pool: &str,
        work: F,
    ) -> Result<(T, Attempt)>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(pool, self.policy.max_attempts, work).await
    }

    /// Run `work` with up to `max_attempts` credentials (at least one).
    ///
    /// `UnknownPool` and `PoolExhausted` from acquisition propagate at once,
    /// on any attempt. When every attempt fails the last error is returned
    /// inside `RetriesExhausted`.
    pub async fn execute_with_attempts<T, E, F, Fut>(
        &self,
        pool: &str,
        max_attempts: u32,
        work: F,
    ) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let (value, _) = self.run(pool, max_attempts, work).await?;
        Ok(value)
    }

    async fn run<T, E, F, Fut>(
        &self,
        pool: &str,
        max_attempts: u32,
        mut work: F,
    ) -> Result<(T, Attempt)>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let credential = self.manager.acquire(pool)?;
            debug!(
                pool,
                credential = %redact(&credential),
                attempt = attempt + 1,
                max_attempts,
                "attempting call"
            );

            match work(credential.clone()).await {
                Ok(value) => {
                    self.manager.report(pool, &credential, true);
                    let meta = Attempt {
                        number: attempt + 1,
                        fingerprint: redact(&credential),
                    };
                    return Ok((value, meta));
                }
                Err(e) => {
                    self.manager.report(pool, &credential, false);
                    let source: BoxError = e.into();

                    if attempt + 1 >= max_attempts {
                        warn!(pool, attempts = max_attempts, error = %source, "all attempts failed");
                        return Err(Error::RetriesExhausted {
                            pool: pool.to_string(),
                            attempts: max_attempts,
                            source,
                        });
                    }

                    let delay = self.policy.backoff(attempt);
                    warn!(
                        pool,
                        credential = %redact(&credential),
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %source,
                        "call failed, retrying with another credential"
                    );
                    metrics::record_retry(pool);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
