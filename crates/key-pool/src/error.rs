//! Error types for pool and executor operations

/// Boxed error produced by a unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool name was never registered by `initialize`.
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    /// Every credential in the pool is cooling down (or the pool is empty).
    #[error("pool exhausted: {pool} has no eligible credentials ({cooling_down}/{total} cooling down)")]
    PoolExhausted {
        pool: String,
        total: usize,
        cooling_down: usize,
    },

    /// Every attempt of an executor call failed; `source` is the last failure.
    #[error("retries exhausted for pool {pool} after {attempts} attempts: {source}")]
    RetriesExhausted {
        pool: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Whether the caller may retry the whole operation later.
    ///
    /// `UnknownPool` is a programming error and never becomes retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::UnknownPool(_))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
