//! Authentication error types

use thiserror::Error;

/// Errors surfaced by [`TokenCoordinator`](super::TokenCoordinator).
///
/// `Clone` because one refresh outcome is shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No session exists
    #[error("no access token available")]
    NotAuthenticated,

    /// The session is over; the user has to log in again
    #[error("authentication expired")]
    Expired,

    /// The refresh endpoint could not be reached; the session is kept
    #[error("token refresh unavailable: {0}")]
    RefreshUnavailable(String),

    /// The token store failed
    #[error("token storage error: {0}")]
    Storage(String),
}

/// Errors from a [`TokenStore`](super::TokenStore) backend
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored token data is corrupt: {0}")]
    Corrupt(String),
}

impl From<TokenStoreError> for AuthError {
    fn from(err: TokenStoreError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

/// Errors from a [`TokenRefresher`](super::TokenRefresher)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The server refused the refresh token
    #[error("refresh token rejected (status {status})")]
    Rejected { status: u16 },

    /// No usable answer from the refresh endpoint
    #[error("refresh endpoint unavailable: {0}")]
    Unavailable(String),
}
