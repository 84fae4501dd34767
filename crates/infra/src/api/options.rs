//! Per-call options for [`ApiClient::request`](super::ApiClient::request)

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Options accepted by every request.
///
/// Defaults: authenticated, uncached, client-wide retry settings, deadline
/// derived from the client configuration.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Attach a bearer token; fail with `AuthenticationRequired` if none
    pub requires_auth: bool,
    /// Opt into the response cache (GET only)
    pub cache: Option<CacheOptions>,
    pub retry: Option<RetryOverrides>,
    /// Overall deadline for the whole call, auth recovery included
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { requires_auth: true, cache: None, retry: None, timeout: None, cancel: None }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send without a bearer token
    #[must_use]
    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    /// Cache a GET response for `ttl`
    #[must_use]
    pub fn cached(self, ttl: Duration) -> Self {
        self.cache_with(CacheOptions::ttl(ttl))
    }

    #[must_use]
    pub fn cache_with(mut self, cache: CacheOptions) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.get_or_insert_with(RetryOverrides::default).max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.retry.get_or_insert_with(RetryOverrides::default).base_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Cache behaviour of one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    /// Explicit cache key; defaults to method plus normalised path
    pub key: Option<String>,
    /// Neither read nor write the cache
    pub skip_cache: bool,
    /// Skip the read but store the fresh response
    pub force_refresh: bool,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl, key: None, skip_cache: false, force_refresh: false }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    #[must_use]
    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Per-call overrides of the client retry configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
}
