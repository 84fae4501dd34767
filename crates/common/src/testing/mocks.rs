//! Mock implementations of the auth seams
//!
//! Provides in-memory doubles for [`TokenStore`] and [`TokenRefresher`].

// Allow missing error/panic docs for test mocks - they are designed to be simple
// and errors are clearly indicated by their return types
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::{RefreshError, TokenRefresher, TokenSet, TokenStore, TokenStoreError};

/// In-memory token store
///
/// # Examples
///
/// ```
/// use fleetbook_common::auth::{TokenSet, TokenStore};
/// use fleetbook_common::testing::MemoryTokenStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryTokenStore::new();
/// store.save(&TokenSet::new("access", None, Some(60))).await.unwrap();
/// assert_eq!(store.stored().unwrap().access_token, "access");
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Option<TokenSet>>,
    saves: AtomicUsize,
    clears: AtomicUsize,
    unavailable: AtomicBool,
    corrupt: AtomicBool,
    save_delay: Duration,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `save` before writing
    #[must_use]
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = delay;
        self
    }

    pub fn with_tokens(tokens: TokenSet) -> Self {
        let store = Self::new();
        *store.tokens.lock() = Some(tokens);
        store
    }

    /// Currently persisted tokens
    pub fn stored(&self) -> Option<TokenSet> {
        self.tokens.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    /// Make every operation fail with [`TokenStoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `load` report corrupt data
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TokenStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TokenStoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<TokenSet>, TokenStoreError> {
        self.check_available()?;
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(TokenStoreError::Corrupt("unexpected end of input".to_string()));
        }
        Ok(self.stored())
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        self.check_available()?;
        if !self.save_delay.is_zero() {
            tokio::time::sleep(self.save_delay).await;
        }
        *self.tokens.lock() = Some(tokens.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), TokenStoreError> {
        self.check_available()?;
        *self.tokens.lock() = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Refresher that replays scripted outcomes in order.
///
/// Once the script is exhausted every call fails with
/// [`RefreshError::Unavailable`].
#[derive(Debug, Default)]
pub struct ScriptedRefresher {
    script: Mutex<VecDeque<Result<TokenSet, RefreshError>>>,
    received: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every refresh call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_ok(&self, tokens: TokenSet) {
        self.script.lock().push_back(Ok(tokens));
    }

    pub fn push_err(&self, err: RefreshError) {
        self.script.lock().push_back(Err(err));
    }

    /// Number of refresh calls made
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens received, in call order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl TokenRefresher for ScriptedRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().push(refresh_token.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RefreshError::Unavailable("no scripted response".to_string())))
    }
}
