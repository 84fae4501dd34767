//! Token persistence using the system keyring
use std::sync::Arc;

use async_trait::async_trait;
use fleetbook_common::auth::{TokenSet, TokenStore, TokenStoreError};
use keyring::Entry;
use tracing::{debug, instrument};

pub const DEFAULT_SERVICE: &str = "com.fleetbook.client";
pub const DEFAULT_ACCOUNT: &str = "session_tokens";

/// Keeps the session tokens in one keyring entry.
///
/// Keyring calls block, so every operation runs on the blocking pool.
#[derive(Clone)]
pub struct KeychainTokenStore {
    entry: Arc<Entry>,
    service: String,
    account: String,
}

impl std::fmt::Debug for KeychainTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeychainTokenStore")
            .field("service", &self.service)
            .field("account", &self.account)
            .finish()
    }
}

impl KeychainTokenStore {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Result<Self, TokenStoreError> {
        let service = service.into();
        let account = account.into();
        let entry = Entry::new(&service, &account).map_err(|e| {
            TokenStoreError::Unavailable(format!("Failed to access keyring: {}", e))
        })?;

        Ok(Self { entry: Arc::new(entry), service, account })
    }

    pub fn with_defaults() -> Result<Self, TokenStoreError> {
        Self::new(DEFAULT_SERVICE, DEFAULT_ACCOUNT)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, TokenStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Entry) -> Result<T, TokenStoreError> + Send + 'static,
    {
        let entry = Arc::clone(&self.entry);
        tokio::task::spawn_blocking(move || op(&entry))
            .await
            .map_err(|e| TokenStoreError::Unavailable(format!("keyring task failed: {}", e)))?
    }
}

fn encode(tokens: &TokenSet) -> Result<String, TokenStoreError> {
    serde_json::to_string(tokens)
        .map_err(|e| TokenStoreError::Unavailable(format!("Failed to encode tokens: {}", e)))
}

fn decode(raw: &str) -> Result<TokenSet, TokenStoreError> {
    serde_json::from_str(raw).map_err(|e| TokenStoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl TokenStore for KeychainTokenStore {
    #[instrument(skip(self), fields(service = %self.service))]
    async fn load(&self) -> Result<Option<TokenSet>, TokenStoreError> {
        let raw = self
            .blocking(|entry| match entry.get_password() {
                Ok(raw) => Ok(Some(raw)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(TokenStoreError::Unavailable(format!("Failed to read tokens: {}", e))),
            })
            .await?;

        match raw {
            Some(raw) => decode(&raw).map(Some),
            None => {
                debug!("No tokens in keyring");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, fields(service = %self.service))]
    async fn save(&self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        let raw = encode(tokens)?;
        self.blocking(move |entry| {
            entry
                .set_password(&raw)
                .map_err(|e| TokenStoreError::Unavailable(format!("Failed to store tokens: {}", e)))
        })
        .await?;
        debug!("Tokens written to keyring");
        Ok(())
    }

    #[instrument(skip(self), fields(service = %self.service))]
    async fn clear(&self) -> Result<(), TokenStoreError> {
        self.blocking(|entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                Err(TokenStoreError::Unavailable(format!("Failed to delete tokens: {}", e)))
            }
        })
        .await
    }
}
