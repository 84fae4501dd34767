//! Lazily created circuit breakers, one per endpoint group
//!
//! A request path maps to its group by the first path segment
//! (`/vehicles/42?x=1` → `vehicles`). With per-group breakers disabled every
//! path shares the single `global` breaker.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::clock::{Clock, SystemClock};
use crate::error::ConfigResult;

/// Group name used when breakers are not split per endpoint group
pub const GLOBAL_GROUP: &str = "global";

/// Group name for the bare `/` path
pub const ROOT_GROUP: &str = "root";

/// Derive the endpoint group of a request path.
pub fn endpoint_group(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').find(|segment| !segment.is_empty()).unwrap_or(ROOT_GROUP)
}

/// Registry of breakers keyed by endpoint group.
pub struct CircuitBreakerRegistry<C: Clock = SystemClock> {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    per_endpoint_group: bool,
    breakers: DashMap<String, CircuitBreaker<C>>,
    clock: Arc<C>,
}

impl CircuitBreakerRegistry<SystemClock> {
    pub fn new(config: CircuitBreakerConfig, per_endpoint_group: bool) -> ConfigResult<Self> {
        Self::with_clock(config, per_endpoint_group, SystemClock)
    }
}

impl<C: Clock> CircuitBreakerRegistry<C> {
    pub fn with_clock(
        config: CircuitBreakerConfig,
        per_endpoint_group: bool,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            default_config: config,
            overrides: HashMap::new(),
            per_endpoint_group,
            breakers: DashMap::new(),
            clock: Arc::new(clock),
        })
    }

    /// Use a dedicated configuration for one endpoint group.
    pub fn with_group_config(
        mut self,
        group: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        self.overrides.insert(group.into(), config);
        Ok(self)
    }

    /// Group key the given path is tracked under.
    pub fn group_for<'a>(&self, path: &'a str) -> &'a str {
        if self.per_endpoint_group {
            endpoint_group(path)
        } else {
            GLOBAL_GROUP
        }
    }

    /// Breaker guarding `path`, created on first use.
    pub fn breaker_for(&self, path: &str) -> CircuitBreaker<C> {
        self.breaker(self.group_for(path))
    }

    /// Breaker for an explicit group key, created on first use.
    pub fn breaker(&self, group: &str) -> CircuitBreaker<C> {
        if let Some(existing) = self.breakers.get(group) {
            return existing.value().clone();
        }

        self.breakers
            .entry(group.to_string())
            .or_insert_with(|| {
                let config =
                    self.overrides.get(group).cloned().unwrap_or_else(|| self.default_config.clone());
                debug!(group, "Creating circuit breaker");
                CircuitBreaker::from_parts(config, Arc::clone(&self.clock)).named(group)
            })
            .value()
            .clone()
    }

    /// Breaker for `group` if one was created
    pub fn get(&self, group: &str) -> Option<CircuitBreaker<C>> {
        self.breakers.get(group).map(|entry| entry.value().clone())
    }

    /// Snapshot of every known breaker
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> =
            self.breakers.iter().map(|entry| (entry.key().clone(), entry.value().state())).collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!(count = self.breakers.len(), "All circuit breakers reset");
    }
}

impl<C: Clock> std::fmt::Debug for CircuitBreakerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("per_endpoint_group", &self.per_endpoint_group)
            .field("groups", &self.breakers.len())
            .finish()
    }
}
