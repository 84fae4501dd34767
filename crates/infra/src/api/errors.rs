//! API-specific error types
//!
//! Every failure the request pipeline can surface, classified for retry
//! decisions and for callers that need to react (e.g. route to login).

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetbook_common::auth::AuthError;
use fleetbook_common::error::{ErrorClassification, ErrorSeverity};
use thiserror::Error;

/// Categories of API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCategory {
    /// No usable session, or the session was revoked
    Authentication,
    /// Rate limiting (429)
    RateLimit,
    /// Server errors (5xx) and open circuits
    Server,
    /// Client errors (4xx except auth and rate limiting), bad payloads
    Client,
    /// No response reached us (connect failure, timeout)
    Network,
    /// Local configuration, storage or lifecycle problems
    Config,
}

/// API operation errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// No response was received
    #[error("Network error: {0}")]
    Network(String),

    /// A response was received with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String, retry_after: Option<Duration> },

    /// The breaker guarding this endpoint group is open
    #[error("Circuit breaker open for '{group}'")]
    CircuitOpen { group: String },

    /// The retry budget was spent; `source` is the final failure
    #[error("Request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ApiError>,
    },

    /// The call needs a session and none exists
    #[error("Authentication required")]
    AuthenticationRequired,

    /// The session could not be recovered; token state has been cleared
    #[error("Authentication expired")]
    AuthenticationExpired,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Token storage error: {0}")]
    TokenStorage(String),

    #[error("Failed to encode request body: {0}")]
    Encode(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Get the error category for this error
    pub fn category(&self) -> ApiErrorCategory {
        match self {
            Self::Network(_) | Self::Timeout(_) => ApiErrorCategory::Network,
            Self::Http { status, .. } => match *status {
                401 | 403 => ApiErrorCategory::Authentication,
                408 => ApiErrorCategory::Network,
                429 => ApiErrorCategory::RateLimit,
                s if s >= 500 => ApiErrorCategory::Server,
                _ => ApiErrorCategory::Client,
            },
            Self::CircuitOpen { .. } => ApiErrorCategory::Server,
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::AuthenticationRequired | Self::AuthenticationExpired => {
                ApiErrorCategory::Authentication
            }
            Self::Encode(_) | Self::Decode(_) => ApiErrorCategory::Client,
            Self::Cancelled | Self::Config(_) | Self::TokenStorage(_) => ApiErrorCategory::Config,
        }
    }

    /// Whether another attempt of the same request could succeed.
    ///
    /// True when no response arrived, or the status is 408, 429 or 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// HTTP status of the final response, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status: 401, .. })
    }
}

impl ErrorClassification for ApiError {
    fn is_retryable(&self) -> bool {
        ApiError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ApiErrorCategory::Client => ErrorSeverity::Info,
            ApiErrorCategory::Config => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotAuthenticated => Self::AuthenticationRequired,
            AuthError::Expired => Self::AuthenticationExpired,
            AuthError::RefreshUnavailable(message) => Self::Network(message),
            AuthError::Storage(message) => Self::TokenStorage(message),
        }
    }
}

/// Retryable statuses: 408, 429 and every 5xx
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || status >= 500
}

/// Parse a `Retry-After` header value.
///
/// Accepts delta-seconds or an HTTP date; dates in the past yield zero.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}
