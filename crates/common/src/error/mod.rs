//! Shared error infrastructure for the client core.
//!
//! Component errors stay module-specific (`ResilienceError`, `RetryError`,
//! `AuthError`, `CacheError`). What they share lives here:
//!
//! - **[`ErrorClassification`]**: the interface retry policies use to decide
//!   whether a failure is transient.
//! - **[`ConfigError`]**: validation failures raised by configuration
//!   builders across modules.
//! - **[`ErrorSeverity`]**: a severity scale for logging decisions.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Configuration validation error raised by builders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Classification of errors by transience.
///
/// Implemented by error types that flow through a `RetryExecutor`, so that
/// generic policies can make decisions without knowing the concrete type.
pub trait ErrorClassification {
    /// Whether a repeated attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// Server-suggested delay before the next attempt (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Severity used when logging the error.
    fn severity(&self) -> ErrorSeverity {
        if self.is_retryable() {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention from the caller
    Error,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}
