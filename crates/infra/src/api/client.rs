//! Request pipeline
//!
//! [`ApiClient::request`] is the single entry point for outbound calls. It
//! composes the client core in a fixed order:
//!
//! 1. attach a fresh bearer token, or fail with `AuthenticationRequired`
//!    before touching the network
//! 2. answer from a fresh cache entry (GET only, opt-in per call)
//! 3. gate on the endpoint group's circuit breaker
//! 4. retry the transport call inside the breaker-guarded operation
//! 5. on `401`, refresh once and replay outside the retry budget
//! 6. store cacheable responses; invalidate cached reads after mutations
//!
//! The whole chain runs under one overall deadline and can be cancelled.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleetbook_common::auth::{TokenCoordinator, TokenRefresher, TokenSet, TokenStore};
use fleetbook_common::cache::{cache_key, CacheError, CacheLookup, CacheStats, ResponseCache};
use fleetbook_common::resilience::{
    policies, CircuitBreaker, CircuitBreakerRegistry, CircuitState, ResilienceError, RetryConfig,
    RetryError, RetryExecutor,
};
use reqwest::header::{HeaderMap, HeaderName, ACCEPT, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use url::Url;
use uuid::Uuid;

use super::auth::HttpTokenRefresher;
use super::errors::{parse_retry_after, ApiError, ApiErrorCategory};
use super::options::{CacheOptions, RequestOptions, RetryOverrides};
use super::response::ApiResponse;
use crate::config::ClientConfig;
use crate::http::HttpClient;
use crate::storage::KeychainTokenStore;

/// Correlation header attached to every attempt of one logical call
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// API client with resilience patterns.
///
/// Cheap to clone; clones share tokens, breakers and cache.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: HttpClient,
    base_url: Url,
    tokens: TokenCoordinator,
    breakers: CircuitBreakerRegistry,
    cache: ResponseCache,
    retry: RetryConfig,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

/// Body and status of a response that ended the retry chain successfully
struct Fetched {
    status: StatusCode,
    etag: Option<String>,
    body: Bytes,
}

/// Everything one transport attempt needs
struct Outbound<'a> {
    method: &'a Method,
    url: &'a Url,
    body: Option<&'a Value>,
    token: Option<&'a str>,
    etag: Option<&'a str>,
    request_id: Uuid,
}

/// How a GET participates in the cache
struct CachePlan {
    key: String,
    ttl: Duration,
    read: bool,
}

impl CachePlan {
    fn for_request(method: &Method, path: &str, options: Option<&CacheOptions>) -> Option<Self> {
        let options = options.filter(|o| !o.skip_cache)?;
        if *method != Method::GET {
            return None;
        }
        Some(Self {
            key: options.key.clone().unwrap_or_else(|| cache_key(method.as_str(), path)),
            ttl: options.ttl,
            read: !options.force_refresh,
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("tokens", &self.inner.tokens)
            .field("cache", &self.inner.cache)
            .field("disposed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl ApiClient {
    /// Create a client from configuration with the default keychain store
    /// and HTTP refresher.
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        Self::builder().config(config).build()
    }

    /// Create a builder for fluent configuration
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    /// Load the persisted session. Returns `true` when one was restored.
    pub async fn init(&self) -> Result<bool, ApiError> {
        let restored = self.inner.tokens.initialize().await?;
        info!(restored, base_url = %self.inner.base_url, "API client initialized");
        Ok(restored)
    }

    /// Start a session with tokens obtained from a login flow.
    pub async fn login(&self, tokens: TokenSet) -> Result<(), ApiError> {
        self.inner.tokens.set_tokens(tokens).await?;
        Ok(())
    }

    /// End the session and drop cached responses.
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.inner.cache.invalidate(None);
        self.inner.tokens.logout().await?;
        Ok(())
    }

    /// Close every breaker and empty the cache.
    pub fn reset(&self) {
        self.inner.breakers.reset_all();
        self.inner.cache.invalidate(None);
        info!("API client reset");
    }

    /// Cancel in-flight calls and refuse new ones.
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
        self.inner.cache.invalidate(None);
        info!("API client disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn tokens(&self) -> &TokenCoordinator {
        &self.inner.tokens
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.inner.breakers.states()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop cached entries whose key contains `pattern`, or all of them.
    pub fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
        self.inner.cache.invalidate(pattern)
    }

    /// Execute a request through the full pipeline.
    ///
    /// # Errors
    ///
    /// - `AuthenticationRequired` if auth is required and there is no session
    /// - `AuthenticationExpired` if the session could not be recovered
    /// - `CircuitOpen` if the endpoint group's breaker rejects the call
    /// - `RetriesExhausted` wrapping the final failure once the budget is spent
    /// - `Http` for non-retryable statuses
    /// - `Timeout` when the overall deadline passes, `Cancelled` on cancellation
    #[instrument(
        skip_all,
        fields(method = %method, path = %path, request_id = tracing::field::Empty)
    )]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let request_id = Uuid::new_v4();
        Span::current().record("request_id", tracing::field::display(request_id));

        let retry = self.retry_config(options.retry)?;
        let deadline = options
            .timeout
            .unwrap_or_else(|| retry.max_chain_duration(self.inner.request_timeout));

        let cancel = self.inner.shutdown.child_token();
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        let call = self.run(&method, path, body.as_ref(), &options, retry, &cancel, request_id);
        let result = tokio::select! {
            biased;
            () = cancelled(options.cancel.as_ref()) => {
                debug!("Request cancelled by caller");
                Err(ApiError::Cancelled)
            }
            () = cancel.cancelled() => Err(ApiError::Cancelled),
            outcome = tokio::time::timeout(deadline, call) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        "Request deadline exceeded"
                    );
                    Err(ApiError::Timeout(deadline))
                }
            },
        };

        match &result {
            Ok(response) => debug!(
                status = response.status.as_u16(),
                from_cache = response.from_cache,
                "Request completed"
            ),
            Err(err) if err.category() == ApiErrorCategory::Client => {
                debug!(error = %err, "Request failed")
            }
            Err(err) => warn!(error = %err, "Request failed"),
        }
        result
    }

    /// GET and decode JSON.
    ///
    /// A cached payload that fails to decode is dropped from the cache and
    /// fetched again from the network.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let response = self.request(Method::GET, path, None, options.clone()).await?;
        match response.json() {
            Ok(value) => Ok(value),
            Err(err) if response.from_cache => {
                let Some(plan) = CachePlan::for_request(&Method::GET, path, options.cache.as_ref())
                else {
                    return Err(err);
                };
                let cache_err = CacheError::Corrupt { key: plan.key.clone(), message: err.to_string() };
                warn!(error = %cache_err, "Discarding undecodable cache entry");
                self.inner.cache.remove(&plan.key);

                let mut refetch = options;
                if let Some(cache) = refetch.cache.as_mut() {
                    cache.force_refresh = true;
                }
                self.request(Method::GET, path, None, refetch).await?.json()
            }
            Err(err) => Err(err),
        }
    }

    /// POST a JSON body and decode the JSON response.
    pub async fn post_json<B, R>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = encode(body)?;
        self.request(Method::POST, path, Some(body), options).await?.json()
    }

    /// PUT a JSON body and decode the JSON response.
    pub async fn put_json<B, R>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = encode(body)?;
        self.request(Method::PUT, path, Some(body), options).await?.json()
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, path, None, options).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        options: &RequestOptions,
        retry: RetryConfig,
        cancel: &CancellationToken,
        request_id: Uuid,
    ) -> Result<ApiResponse, ApiError> {
        let inner = &self.inner;

        let mut token = if options.requires_auth {
            match inner.tokens.ensure_fresh().await? {
                Some(token) => Some(token),
                None => {
                    debug!("No session for authenticated request");
                    return Err(ApiError::AuthenticationRequired);
                }
            }
        } else {
            None
        };

        let plan = CachePlan::for_request(method, path, options.cache.as_ref());
        let mut stale = None;
        if let Some(plan) = plan.as_ref().filter(|p| p.read) {
            match inner.cache.lookup(&plan.key) {
                CacheLookup::Fresh(entry) => {
                    debug!(key = %plan.key, "Serving fresh cache entry");
                    return Ok(ApiResponse::from_entry(&entry, false));
                }
                CacheLookup::Stale(entry) if entry.etag.is_some() => stale = Some(entry),
                CacheLookup::Stale(_) | CacheLookup::Miss => {}
            }
        }

        let url = join_url(&inner.base_url, path)?;
        let group = inner.breakers.group_for(path).to_string();
        let breaker = inner.breakers.breaker(&group);
        let executor = RetryExecutor::new(retry, policies::Classified);
        let etag = stale.as_ref().and_then(|entry| entry.etag.clone());

        let mut replayed = false;
        let fetched = loop {
            let outbound = Outbound {
                method,
                url: &url,
                body,
                token: token.as_deref(),
                etag: etag.as_deref(),
                request_id,
            };
            match self.guarded_send(&breaker, &group, &executor, &outbound, cancel).await {
                Err(err) if err.is_unauthorized() => {
                    let Some(rejected) = token.take() else {
                        return Err(err);
                    };
                    if replayed {
                        warn!("Replayed request rejected with 401, ending session");
                        inner.tokens.expire_session().await;
                        return Err(ApiError::AuthenticationExpired);
                    }
                    info!("Received 401, refreshing token and replaying once");
                    replayed = true;
                    token = Some(inner.tokens.recover_from_unauthorized(&rejected).await?);
                }
                other => break other?,
            }
        };

        if fetched.status == StatusCode::NOT_MODIFIED {
            if let (Some(plan), Some(entry)) = (plan.as_ref(), stale.as_ref()) {
                let renewed = inner.cache.renew(&plan.key).unwrap_or_else(|| {
                    inner.cache.store(
                        plan.key.clone(),
                        entry.payload.clone(),
                        entry.etag.clone(),
                        Some(plan.ttl),
                    )
                });
                debug!(key = %plan.key, "Stale cache entry revalidated");
                return Ok(ApiResponse::from_entry(&renewed, true));
            }
        }

        if fetched.status.is_success() {
            if let Some(plan) = plan.as_ref() {
                inner.cache.store(
                    plan.key.clone(),
                    fetched.body.clone(),
                    fetched.etag.clone(),
                    Some(plan.ttl),
                );
            }
            if is_mutation(method) {
                if let Some(prefix) = resource_prefix(path) {
                    inner.cache.invalidate(Some(&prefix));
                }
            }
        }

        Ok(ApiResponse {
            status: fetched.status,
            etag: fetched.etag,
            body: fetched.body,
            from_cache: false,
            revalidated: false,
        })
    }

    async fn guarded_send(
        &self,
        breaker: &CircuitBreaker,
        group: &str,
        executor: &RetryExecutor<policies::Classified>,
        outbound: &Outbound<'_>,
        cancel: &CancellationToken,
    ) -> Result<Fetched, ApiError> {
        breaker
            .execute_classified(
                || executor.execute(|| self.send_once(outbound), cancel),
                counts_against_circuit,
            )
            .await
            .map_err(|err| map_resilience_error(err, group))
    }

    async fn send_once(&self, outbound: &Outbound<'_>) -> Result<Fetched, ApiError> {
        let http = &self.inner.http;
        let mut builder = http
            .request(outbound.method.clone(), outbound.url.clone())
            .header(REQUEST_ID_HEADER, outbound.request_id.to_string())
            .header(ACCEPT, "application/json");
        if let Some(token) = outbound.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(etag) = outbound.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(body) = outbound.body {
            builder = builder.json(body);
        }

        let response = http.send(builder).await?;
        let status = response.status();
        let etag = header_string(response.headers(), &ETAG);

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            let body = response
                .bytes()
                .await
                .map_err(|e| ApiError::Network(format!("failed to read response body: {e}")))?;
            return Ok(Fetched { status, etag, body });
        }

        let retry_after =
            header_string(response.headers(), &RETRY_AFTER).as_deref().and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Http { status: status.as_u16(), body, retry_after })
    }

    fn retry_config(&self, overrides: Option<RetryOverrides>) -> Result<RetryConfig, ApiError> {
        let mut config = self.inner.retry.clone();
        if let Some(overrides) = overrides {
            if let Some(attempts) = overrides.max_attempts {
                config.max_attempts = attempts;
            }
            if let Some(delay) = overrides.base_delay {
                config.base_delay = delay;
            }
        }
        config.validate().map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// Retry chains that ended on a transient failure count against the
/// circuit; fatal responses prove the dependency is up.
fn counts_against_circuit(err: &RetryError<ApiError>) -> bool {
    match err {
        RetryError::Exhausted { .. } | RetryError::TimeoutExceeded { .. } => true,
        RetryError::NonRetryable { .. } | RetryError::Cancelled => false,
    }
}

fn map_resilience_error(err: ResilienceError<RetryError<ApiError>>, group: &str) -> ApiError {
    match err {
        ResilienceError::CircuitOpen => ApiError::CircuitOpen { group: group.to_string() },
        ResilienceError::OperationFailed { source } => match source {
            RetryError::Exhausted { attempts, source } => {
                ApiError::RetriesExhausted { attempts, source: Box::new(source) }
            }
            RetryError::NonRetryable { source } => source,
            RetryError::TimeoutExceeded { elapsed, .. } => ApiError::Timeout(elapsed),
            RetryError::Cancelled => ApiError::Cancelled,
        },
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::Encode(e.to_string()))
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
}

fn is_mutation(method: &Method) -> bool {
    ![Method::GET, Method::HEAD, Method::OPTIONS].contains(method)
}

/// Substring matching every default cache key of the path's resource,
/// e.g. `/vehicles/42` → ` /vehicles`.
fn resource_prefix(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').find(|segment| !segment.is_empty()).map(|segment| format!(" /{segment}"))
}

/// Append `path` to `base`, keeping any path prefix of the base URL.
pub(crate) fn join_url(base: &Url, path: &str) -> Result<Url, ApiError> {
    let base = base.as_str().trim_end_matches('/');
    let joined = if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    Url::parse(&joined).map_err(|e| ApiError::Config(format!("invalid request URL '{joined}': {e}")))
}

/// Builder for API client
#[derive(Default)]
pub struct ApiClientBuilder {
    config: Option<ClientConfig>,
    store: Option<Arc<dyn TokenStore>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    http: Option<HttpClient>,
}

impl ApiClientBuilder {
    /// Set the client configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override only the base URL
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.get_or_insert_with(ClientConfig::default).api.base_url = base_url.into();
        self
    }

    /// Persist tokens somewhere other than the system keyring
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Refresh tokens with something other than the HTTP refresh endpoint
    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn http_client(mut self, http: HttpClient) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the API client
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid or the HTTP client
    /// cannot be created, `TokenStorage` if the keyring is inaccessible.
    pub fn build(self) -> Result<ApiClient, ApiError> {
        let config = self.config.unwrap_or_default();
        config.validate().map_err(|e| ApiError::Config(e.to_string()))?;

        let base_url = Url::parse(&config.api.base_url)
            .map_err(|e| ApiError::Config(format!("invalid base URL: {e}")))?;

        let http = match self.http {
            Some(http) => http,
            None => HttpClient::builder()
                .timeout(config.api.request_timeout)
                .user_agent(config.api.user_agent.clone())
                .build()?,
        };

        let store: Arc<dyn TokenStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                KeychainTokenStore::new(
                    config.auth.keychain_service.clone(),
                    config.auth.keychain_account.clone(),
                )
                .map_err(|e| ApiError::TokenStorage(e.to_string()))?,
            ),
        };

        let refresher: Arc<dyn TokenRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => Arc::new(HttpTokenRefresher::new(
                http.clone(),
                join_url(&base_url, &config.api.refresh_path)?,
            )),
        };

        let breakers = CircuitBreakerRegistry::new(
            config.circuit_breaker.config.clone(),
            config.circuit_breaker.per_endpoint_group,
        )
        .and_then(|registry| {
            config.circuit_breaker.groups.iter().try_fold(registry, |registry, (group, settings)| {
                registry.with_group_config(group.as_str(), settings.clone())
            })
        })
        .map_err(|e| ApiError::Config(e.to_string()))?;
        let cache =
            ResponseCache::new(config.cache.clone()).map_err(|e| ApiError::Config(e.to_string()))?;

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                tokens: TokenCoordinator::new(store, refresher, config.auth.refresh_margin),
                breakers,
                cache,
                retry: config.retry,
                request_timeout: config.api.request_timeout,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}
