//! Configuration loading and management
//!
//! [`ClientConfig`] gathers every tunable of the client core. It is
//! deserialised from JSON or TOML (durations in milliseconds) and can be
//! overridden by `FLEETBOOK_*` environment variables, see [`loader`].

pub mod loader;

use std::collections::HashMap;
use std::time::Duration;

use fleetbook_common::cache::CacheConfig;
use fleetbook_common::resilience::{CircuitBreakerConfig, RetryConfig};
use fleetbook_common::utils::duration_millis;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::auth::DEFAULT_REFRESH_PATH;
use crate::storage::{DEFAULT_ACCOUNT, DEFAULT_SERVICE};

// Re-export commonly used items
pub use loader::{load, load_from_env, load_from_file, probe_config_paths, ConfigLoadError};

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: BreakerSettings,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        self.api.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.config.validate()?;
        for (group, config) in &self.circuit_breaker.groups {
            config.validate().map_err(|e| {
                ConfigLoadError::Invalid(format!("circuit_breaker.groups.{group}: {e}"))
            })?;
        }
        self.cache.validate()?;
        Ok(())
    }
}

/// Endpoint and transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub refresh_path: String,
    /// Timeout of a single attempt
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.fleetbook.app/v1".to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("fleetbook-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ApiConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            ConfigLoadError::Invalid(format!("api.base_url '{}': {}", self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigLoadError::Invalid(format!(
                "api.base_url must be http(s), got '{}'",
                url.scheme()
            )));
        }
        if !self.refresh_path.starts_with('/') {
            return Err(ConfigLoadError::Invalid("api.refresh_path must start with '/'".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigLoadError::Invalid("api.request_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Breaker thresholds plus how breakers are scoped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    #[serde(flatten)]
    pub config: CircuitBreakerConfig,
    /// One breaker per first path segment instead of one global breaker
    pub per_endpoint_group: bool,
    /// Thresholds for specific endpoint groups, keyed by group name
    pub groups: HashMap<String, CircuitBreakerConfig>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            per_endpoint_group: true,
            groups: HashMap::new(),
        }
    }
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Refresh tokens this long before they expire
    #[serde(with = "duration_millis")]
    pub refresh_margin: Duration,
    pub keychain_service: String,
    pub keychain_account: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_margin: fleetbook_common::auth::DEFAULT_REFRESH_MARGIN,
            keychain_service: DEFAULT_SERVICE.to_string(),
            keychain_account: DEFAULT_ACCOUNT.to_string(),
        }
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info,fleetbook_infra=debug`
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_string(), json: false }
    }
}
