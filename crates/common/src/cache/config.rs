//! Response cache configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::utils::duration_millis;

/// Configuration for [`ResponseCache`](super::ResponseCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries (None = unlimited). The oldest stored entry
    /// is evicted when the limit is reached.
    pub max_entries: Option<usize>,

    /// TTL applied when a store does not specify one
    #[serde(with = "duration_millis")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: Some(512), default_ttl: Duration::from_secs(60) }
    }
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_entries == Some(0) {
            return Err(ConfigError::invalid("max_entries must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`]
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = Some(max);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.config.max_entries = None;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    pub fn build(self) -> ConfigResult<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validation() {
        let config = CacheConfig::builder()
            .max_entries(10)
            .default_ttl(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(config.max_entries, Some(10));
        assert_eq!(config.default_ttl, Duration::from_secs(5));

        assert!(CacheConfig::builder().max_entries(0).build().is_err());
        assert_eq!(CacheConfig::builder().unbounded().build().unwrap().max_entries, None);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CacheConfig = serde_json::from_str(r#"{"default_ttl":1500}"#).unwrap();
        assert_eq!(config.default_ttl, Duration::from_millis(1500));
        assert_eq!(config.max_entries, Some(512));
    }
}
