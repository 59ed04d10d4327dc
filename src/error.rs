//! Error taxonomy for the security core.
//!
//! Validation, rate-limit and circuit-breaker refusals are meant to be shown
//! to the user. `Config` is fatal at startup. `Audit` is raised only when
//! neither the rotating file nor the backing store accepted an event and
//! should be treated as near-fatal by callers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for security-core operations.
pub type Result<T> = std::result::Result<T, SecurityError>;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("Rate limit exceeded for {operation} ({identifier}): {limit} per {window:?}")]
    RateLimitExceeded {
        operation: String,
        identifier: String,
        limit: u32,
        window: Duration,
    },

    #[error("circuit breaker open, retry in {retry_in:?}")]
    CircuitBreakerOpen { retry_in: Duration },

    #[error("corrupted file {}: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    #[error("audit trail unavailable: {0}")]
    Audit(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    /// Stable snake_case label, used in audit details of failed attempts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Validation(_) => "validation_error",
            Self::Encryption(_) => "encryption_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::Corruption { .. } => "corruption_error",
            Self::Audit(_) => "audit_error",
            Self::Storage(_) => "storage_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether the caller can reasonably retry or correct the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::RateLimitExceeded { .. } | Self::CircuitBreakerOpen { .. }
        )
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<rusqlite::Error> for SecurityError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
