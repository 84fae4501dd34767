//! Single-flight token coordination
//!
//! [`TokenCoordinator`] owns the session's [`TokenSet`] and guarantees that
//! at most one refresh call runs at a time. The first caller that finds the
//! token expiring installs a shared future under the state lock and spawns
//! the refresh on the runtime; every later caller awaits a clone of that
//! future. Because the refresh runs in its own task, a waiter that gives up
//! (cancellation, deadline) never aborts the refresh for the others.
//!
//! The state lock only guards in-memory transitions and is never held across
//! I/O. Store writes are serialised by a separate async persist lock, and
//! every write re-checks the session under it, so the store always ends up
//! matching the latest in-memory session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use super::error::{AuthError, RefreshError, TokenStoreError};
use super::traits::{TokenRefresher, TokenStore};
use super::types::TokenSet;

/// Refresh this long before `expires_at`
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

type RefreshOutcome = Result<String, AuthError>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Default)]
struct TokenState {
    tokens: Option<TokenSet>,
    refresh_in_flight: Option<RefreshFuture>,
    /// Bumped whenever the session is replaced or ended, so a refresh that
    /// started under an older session cannot write into the new one.
    session: u64,
}

struct Inner {
    state: Mutex<TokenState>,
    /// Held across every store write together with the matching state change
    persist: AsyncMutex<()>,
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_margin: Duration,
}

/// Supplies access tokens to outbound requests and keeps them fresh.
///
/// Cloning yields a handle to the same session.
#[derive(Clone)]
pub struct TokenCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for TokenCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TokenCoordinator")
            .field("tokens", &state.tokens)
            .field("refreshing", &state.refresh_in_flight.is_some())
            .field("refresh_margin", &self.inner.refresh_margin)
            .finish()
    }
}

impl TokenCoordinator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TokenState::default()),
                persist: AsyncMutex::new(()),
                store,
                refresher,
                refresh_margin,
            }),
        }
    }

    /// Load persisted tokens.
    ///
    /// Returns `true` when a session was restored. Corrupt stored data is
    /// discarded rather than treated as an error.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<bool, AuthError> {
        let _persist = self.inner.persist.lock().await;
        match self.inner.store.load().await {
            Ok(Some(tokens)) => {
                let mut state = self.inner.state.lock();
                state.tokens = Some(tokens);
                state.refresh_in_flight = None;
                state.session += 1;
                info!("Token coordinator initialized with stored session");
                Ok(true)
            }
            Ok(None) => {
                debug!("No stored session found");
                Ok(false)
            }
            Err(TokenStoreError::Corrupt(message)) => {
                warn!(error = %message, "Discarding corrupt stored tokens");
                self.inner.store.clear().await?;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Start a new session (login) and persist it.
    #[instrument(skip_all)]
    pub async fn set_tokens(&self, tokens: TokenSet) -> Result<(), AuthError> {
        let _persist = self.inner.persist.lock().await;
        {
            let mut state = self.inner.state.lock();
            state.tokens = Some(tokens.clone());
            state.refresh_in_flight = None;
            state.session += 1;
        }
        self.inner.store.save(&tokens).await?;
        info!("Session tokens stored");
        Ok(())
    }

    /// Current access token, without any freshness check
    pub fn access_token(&self) -> Option<String> {
        self.inner.state.lock().tokens.as_ref().map(|t| t.access_token.clone())
    }

    /// Current token set
    pub fn tokens(&self) -> Option<TokenSet> {
        self.inner.state.lock().tokens.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().tokens.is_some()
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().refresh_in_flight.is_some()
    }

    pub fn refresh_margin(&self) -> Duration {
        self.inner.refresh_margin
    }

    /// Return a token that is valid beyond the refresh margin, refreshing
    /// first if needed.
    ///
    /// `Ok(None)` means there is no session at all.
    ///
    /// # Errors
    /// [`AuthError::Expired`] when the refresh token was rejected (the
    /// session is cleared), [`AuthError::RefreshUnavailable`] when the
    /// refresh endpoint could not be reached (the session is kept).
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self) -> Result<Option<String>, AuthError> {
        let refresh = {
            let mut state = self.inner.state.lock();
            let Some(tokens) = state.tokens.as_ref() else {
                return Ok(None);
            };
            if state.refresh_in_flight.is_none() && !tokens.needs_refresh(self.inner.refresh_margin)
            {
                return Ok(Some(tokens.access_token.clone()));
            }
            self.join_or_start_refresh(&mut state)
        };

        refresh.await.map(Some)
    }

    /// Handle a `401` for a request that carried `rejected_token`.
    ///
    /// If the session token already changed since that request was sent,
    /// the newer token is returned without another refresh. Otherwise a
    /// refresh is forced, joining one already in flight.
    #[instrument(skip_all)]
    pub async fn recover_from_unauthorized(&self, rejected_token: &str) -> Result<String, AuthError> {
        let refresh = {
            let mut state = self.inner.state.lock();
            let current = state.tokens.as_ref().map(|t| t.access_token.clone());
            match current {
                None => return Err(AuthError::Expired),
                Some(token) if token != rejected_token => {
                    debug!("Token was replaced while the request was in flight");
                    return Ok(token);
                }
                Some(_) => self.join_or_start_refresh(&mut state),
            }
        };

        refresh.await
    }

    /// End the session after a terminal authentication failure.
    #[instrument(skip(self))]
    pub async fn expire_session(&self) {
        let _persist = self.inner.persist.lock().await;
        self.inner.clear_state();
        if let Err(err) = self.inner.store.clear().await {
            warn!(error = %err, "Failed to clear stored tokens after session expiry");
        }
        info!("Session expired, tokens cleared");
    }

    /// End the session on user request.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), AuthError> {
        let _persist = self.inner.persist.lock().await;
        self.inner.clear_state();
        self.inner.store.clear().await?;
        info!("Tokens cleared (logged out)");
        Ok(())
    }

    fn join_or_start_refresh(&self, state: &mut TokenState) -> RefreshFuture {
        if let Some(in_flight) = &state.refresh_in_flight {
            debug!("Joining in-flight token refresh");
            return in_flight.clone();
        }

        let refresh_token = state.tokens.as_ref().and_then(|t| t.refresh_token.clone());
        let session = state.session;
        let leader = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { leader.run_refresh(refresh_token, session).await });

        let cleanup = Arc::clone(&self.inner);
        let shared = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    cleanup.finish_refresh(session);
                    Err(AuthError::RefreshUnavailable(format!("refresh task failed: {join_err}")))
                }
            }
        }
        .boxed()
        .shared();

        state.refresh_in_flight = Some(shared.clone());
        shared
    }
}

impl Inner {
    async fn run_refresh(&self, refresh_token: Option<String>, session: u64) -> RefreshOutcome {
        let Some(refresh_token) = refresh_token else {
            warn!("Access token expired and no refresh token is available");
            self.end_session(session).await;
            return Err(AuthError::Expired);
        };

        info!("Refreshing access token");
        match self.refresher.refresh(&refresh_token).await {
            Ok(mut tokens) => {
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }

                let _persist = self.persist.lock().await;
                let applied = {
                    let mut state = self.state.lock();
                    if state.session == session {
                        state.tokens = Some(tokens.clone());
                        state.refresh_in_flight = None;
                        true
                    } else {
                        false
                    }
                };

                if !applied {
                    debug!("Session changed during refresh, discarding result");
                    return self
                        .state
                        .lock()
                        .tokens
                        .as_ref()
                        .map(|t| t.access_token.clone())
                        .ok_or(AuthError::NotAuthenticated);
                }

                if let Err(err) = self.store.save(&tokens).await {
                    warn!(error = %err, "Failed to persist refreshed tokens");
                }
                info!(expires_in = ?tokens.seconds_until_expiry(), "Access token refreshed");
                Ok(tokens.access_token)
            }
            Err(RefreshError::Rejected { status }) => {
                warn!(status, "Refresh token rejected, ending session");
                self.end_session(session).await;
                Err(AuthError::Expired)
            }
            Err(RefreshError::Unavailable(message)) => {
                warn!(error = %message, "Token refresh failed, keeping session");
                self.finish_refresh(session);
                Err(AuthError::RefreshUnavailable(message))
            }
        }
    }

    /// Clear the in-flight marker if it still belongs to `session`.
    fn finish_refresh(&self, session: u64) {
        let mut state = self.state.lock();
        if state.session == session {
            state.refresh_in_flight = None;
        }
    }

    /// Clear the session if it is still `session`, then the store.
    async fn end_session(&self, session: u64) {
        let _persist = self.persist.lock().await;
        let cleared = {
            let mut state = self.state.lock();
            if state.session == session {
                state.tokens = None;
                state.refresh_in_flight = None;
                state.session += 1;
                true
            } else {
                false
            }
        };

        if cleared {
            if let Err(err) = self.store.clear().await {
                warn!(error = %err, "Failed to clear stored tokens");
            }
        }
    }

    fn clear_state(&self) {
        let mut state = self.state.lock();
        state.tokens = None;
        state.refresh_in_flight = None;
        state.session += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::testing::{MemoryTokenStore, ScriptedRefresher};

    fn expired(access: &str) -> TokenSet {
        TokenSet::with_expiry(
            access,
            Some("refresh-1".into()),
            Some(Utc::now() - chrono::Duration::seconds(5)),
        )
    }

    fn valid(access: &str) -> TokenSet {
        TokenSet::new(access, Some("refresh-1".into()), Some(3600))
    }

    fn coordinator(
        store: &Arc<MemoryTokenStore>,
        refresher: &Arc<ScriptedRefresher>,
    ) -> TokenCoordinator {
        TokenCoordinator::new(store.clone(), refresher.clone(), DEFAULT_REFRESH_MARGIN)
    }

    #[tokio::test]
    async fn test_initialize_restores_session() {
        let store = Arc::new(MemoryTokenStore::with_tokens(valid("stored")));
        let refresher = Arc::new(ScriptedRefresher::new());
        let coord = coordinator(&store, &refresher);

        assert!(coord.initialize().await.unwrap());
        assert_eq!(coord.access_token().as_deref(), Some("stored"));

        let empty = coordinator(&Arc::new(MemoryTokenStore::new()), &refresher);
        assert!(!empty.initialize().await.unwrap());
        assert!(!empty.is_authenticated());
    }

    #[tokio::test]
    async fn test_ensure_fresh_returns_valid_token_without_refresh() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(valid("a1")).await.unwrap();

        assert_eq!(coord.ensure_fresh().await.unwrap().as_deref(), Some("a1"));
        assert_eq!(refresher.calls(), 0);
        assert_eq!(store.stored().unwrap().access_token, "a1");
    }

    #[tokio::test]
    async fn test_ensure_fresh_without_session() {
        let coord =
            coordinator(&Arc::new(MemoryTokenStore::new()), &Arc::new(ScriptedRefresher::new()));
        assert_eq!(coord.ensure_fresh().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_ok(TokenSet::new("a2", Some("refresh-2".into()), Some(3600)));
        let coord = coordinator(&store, &refresher);
        coord
            .set_tokens(TokenSet::new("a1", Some("refresh-1".into()), Some(30)))
            .await
            .unwrap();

        assert_eq!(coord.ensure_fresh().await.unwrap().as_deref(), Some("a2"));
        assert_eq!(refresher.received(), vec!["refresh-1".to_string()]);
        assert_eq!(store.stored().unwrap().refresh_token.as_deref(), Some("refresh-2"));
        assert!(!coord.is_refreshing());
    }

    /// Validates single-flight refresh under concurrent demand.
    ///
    /// Assertions:
    /// - Ten concurrent callers trigger exactly one refresh call.
    /// - Every caller observes the same refreshed token.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new().with_delay(Duration::from_millis(50)));
        refresher.push_ok(valid("fresh"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let coord = coord.clone();
                tokio::spawn(async move { coord.ensure_fresh().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().as_deref(), Some("fresh"));
        }
        assert_eq!(refresher.calls(), 1);
    }

    /// Validates that logout stays durable while a refresh is still persisting.
    ///
    /// # Test Steps
    /// 1. Store takes 50ms per save; the session token is already expired
    /// 2. Start a refresh, then log out 10ms later
    /// 3. Verify neither memory nor the store holds a session afterwards
    #[tokio::test]
    async fn test_logout_during_refresh_save_is_durable() {
        let store = Arc::new(MemoryTokenStore::new().with_save_delay(Duration::from_millis(50)));
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_ok(valid("fresh"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        let refreshing = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.ensure_fresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coord.logout().await.unwrap();
        let _ = refreshing.await.unwrap();

        assert!(!coord.is_authenticated());
        assert!(store.stored().is_none());

        let restarted = coordinator(&store, &refresher);
        assert!(!restarted.initialize().await.unwrap());
    }

    #[tokio::test]
    async fn test_login_during_refresh_save_wins_in_store() {
        let store = Arc::new(MemoryTokenStore::new().with_save_delay(Duration::from_millis(50)));
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_ok(valid("fresh"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        let refreshing = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.ensure_fresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coord.set_tokens(valid("second-login")).await.unwrap();
        let _ = refreshing.await.unwrap();

        assert_eq!(coord.access_token().as_deref(), Some("second-login"));
        assert_eq!(store.stored().unwrap().access_token, "second-login");
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_session() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_err(RefreshError::Rejected { status: 401 });
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        assert_eq!(coord.ensure_fresh().await.unwrap_err(), AuthError::Expired);
        assert!(!coord.is_authenticated());
        assert!(store.stored().is_none());
        assert_eq!(store.clear_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_refresh_keeps_session_and_allows_retry() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_err(RefreshError::Unavailable("connection refused".into()));
        refresher.push_ok(valid("fresh"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        assert!(matches!(coord.ensure_fresh().await, Err(AuthError::RefreshUnavailable(_))));
        assert_eq!(coord.access_token().as_deref(), Some("stale"));

        assert_eq!(coord.ensure_fresh().await.unwrap().as_deref(), Some("fresh"));
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_token_ends_session() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        let coord = coordinator(&store, &refresher);
        coord
            .set_tokens(TokenSet::with_expiry("a", None, Some(Utc::now())))
            .await
            .unwrap();

        assert_eq!(coord.ensure_fresh().await.unwrap_err(), AuthError::Expired);
        assert_eq!(refresher.calls(), 0);
        assert!(!coord.is_authenticated());
    }

    #[tokio::test]
    async fn test_unrotated_refresh_token_is_kept() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_ok(TokenSet::new("a2", None, Some(3600)));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("a1")).await.unwrap();

        coord.ensure_fresh().await.unwrap();
        assert_eq!(coord.tokens().unwrap().refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_recover_skips_refresh_when_token_already_replaced() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(valid("current")).await.unwrap();

        assert_eq!(coord.recover_from_unauthorized("older").await.unwrap(), "current");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_recover_forces_refresh_of_rejected_token() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new());
        refresher.push_ok(valid("replacement"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(valid("revoked")).await.unwrap();

        assert_eq!(coord.recover_from_unauthorized("revoked").await.unwrap(), "replacement");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_recover_without_session_is_expired() {
        let coord =
            coordinator(&Arc::new(MemoryTokenStore::new()), &Arc::new(ScriptedRefresher::new()));
        assert_eq!(coord.recover_from_unauthorized("x").await.unwrap_err(), AuthError::Expired);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_abort_refresh() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new().with_delay(Duration::from_millis(50)));
        refresher.push_ok(valid("fresh"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        let waiter = tokio::time::timeout(Duration::from_millis(5), coord.ensure_fresh()).await;
        assert!(waiter.is_err(), "waiter should give up before the refresh completes");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coord.access_token().as_deref(), Some("fresh"));
        assert_eq!(store.stored().unwrap().access_token, "fresh");
        assert!(!coord.is_refreshing());
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_result() {
        let store = Arc::new(MemoryTokenStore::new());
        let refresher = Arc::new(ScriptedRefresher::new().with_delay(Duration::from_millis(30)));
        refresher.push_ok(valid("fresh"));
        let coord = coordinator(&store, &refresher);
        coord.set_tokens(expired("stale")).await.unwrap();

        let pending = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.ensure_fresh().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        coord.logout().await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap_err(), AuthError::NotAuthenticated);
        assert!(!coord.is_authenticated());
        assert!(store.stored().is_none());
    }

    #[tokio::test]
    async fn test_expire_session_clears_store() {
        let store = Arc::new(MemoryTokenStore::new());
        let coord = coordinator(&store, &Arc::new(ScriptedRefresher::new()));
        coord.set_tokens(valid("a")).await.unwrap();

        coord.expire_session().await;

        assert!(!coord.is_authenticated());
        assert!(store.stored().is_none());
    }

    #[tokio::test]
    async fn test_initialize_discards_corrupt_store() {
        let store = Arc::new(MemoryTokenStore::new());
        store.set_corrupt(true);
        let coord = coordinator(&store, &Arc::new(ScriptedRefresher::new()));

        assert!(!coord.initialize().await.unwrap());
        assert_eq!(store.clear_count(), 1);
    }
}
