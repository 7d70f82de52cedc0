//! Credential pools with health tracking and retried execution
//!
//! Manages named pools of interchangeable API credentials (for example one
//! pool of LLM keys for retrieval, one for SQL generation, one for
//! summarization). Each request draws a credential uniformly at random from
//! the credentials that are not cooling down, and the caller reports whether
//! the call made with it succeeded.
//!
//! Credential lifecycle:
//! 1. `KeyPoolManager::initialize` seeds every pool, all credentials eligible
//! 2. `acquire` picks a random eligible credential and stamps `last_used`
//! 3. `report(.., false)` bumps `consecutive_errors`; at the threshold the
//!    credential cools down for the configured duration
//! 4. `report(.., true)` resets `consecutive_errors` but never ends a cooldown
//! 5. Cooldown elapses → credential is back in rotation with a clean error count
//!
//! `RequestExecutor` wraps acquire → call → report with bounded retries and
//! exponential backoff. State lives in process memory only.

pub mod clock;
pub mod error;
pub mod executor;
mod metrics;
pub mod pool;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, Error, Result};
pub use executor::{Attempt, RequestExecutor, RetryPolicy};
pub use pool::{CredentialSnapshot, CredentialStatus, HealthPolicy, KeyPoolManager};
