//! Seams for token persistence and the refresh call
//!
//! These traits enable dependency injection and testing by abstracting
//! external dependencies (durable storage, the refresh endpoint).

use async_trait::async_trait;

use super::error::{RefreshError, TokenStoreError};
use super::types::TokenSet;

/// Durable storage for the current [`TokenSet`]
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load persisted tokens. `Ok(None)` when nothing is stored.
    async fn load(&self) -> Result<Option<TokenSet>, TokenStoreError>;

    /// Replace the persisted tokens
    async fn save(&self, tokens: &TokenSet) -> Result<(), TokenStoreError>;

    /// Remove the persisted tokens. Clearing an empty store succeeds.
    async fn clear(&self) -> Result<(), TokenStoreError>;
}

/// Exchanges a refresh token for a new [`TokenSet`]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Perform one refresh call.
    ///
    /// # Errors
    /// [`RefreshError::Rejected`] when the server refuses the refresh token,
    /// [`RefreshError::Unavailable`] for transport or server failures.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, RefreshError>;
}
