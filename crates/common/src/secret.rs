//! Secret wrapper and redaction helpers for credential material

use std::fmt;
use zeroize::Zeroize;

/// Number of trailing characters kept by [`redact`].
const FINGERPRINT_CHARS: usize = 6;

/// Credentials shorter than this are masked entirely.
const MIN_FINGERPRINT_LEN: usize = 12;

/// Sensitive value - redacted in Debug/Display/logs, zeroized on drop
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Short non-secret identifier for logs, see [`redact`].
    pub fn fingerprint(&self) -> String {
        redact(&self.0)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Reduce a credential to a fingerprint safe for logs and operator views.
///
/// Keeps the last six characters of long credentials (`****abc123`); short
/// ones are fully masked since six characters would reveal most of the value.
pub fn redact(credential: &str) -> String {
    let len = credential.chars().count();
    if len < MIN_FINGERPRINT_LEN {
        return "****".to_string();
    }
    let tail: String = credential.chars().skip(len - FINGERPRINT_CHARS).collect();
    format!("****{tail}")
}
