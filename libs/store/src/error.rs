//! Store error types.

use thiserror::Error;

/// Errors from persistent store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("store operation timed out on {key} after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns true if the key itself was rejected.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }

    /// Returns true if the backend did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn invalid(key: &str, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
