//! Circuit breaker guarding calls to an unhealthy dependency
//!
//! The breaker counts consecutive failures. Reaching the threshold opens the
//! circuit: calls fail immediately with [`ResilienceError::CircuitOpen`]
//! until the cooldown elapses. The first call after the cooldown moves the
//! breaker to half-open and runs as the single probe; its outcome either
//! closes the circuit or reopens it with a fresh cooldown.
//!
//! All state lives behind one mutex that is held only for the in-memory
//! transition, never across the guarded operation.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};
use crate::utils::duration_millis;

/// Errors produced by a breaker-guarded call.
///
/// Generic over the operation error so the original failure is preserved.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// The underlying operation failed
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

/// Result type for breaker-guarded operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Circuit breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Cooldown elapsed; a single probe decides the next state
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "CLOSED"),
            CircuitStatus::Open => write!(f, "OPEN"),
            CircuitStatus::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Read-only snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u64,
    pub opened_at: Option<Instant>,
    pub failure_threshold: u64,
    pub cooldown: Duration,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u64,
    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.cooldown.is_zero() {
            return Err(ConfigError::invalid("cooldown must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Set a custom clock and build a breaker directly (useful for testing)
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { config: self.config, clock }
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a CircuitBreaker directly
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::with_clock(self.config, self.clock)
    }
}

/// Counters for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub status: CircuitStatus,
    pub consecutive_failures: u64,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerCore {
    status: CircuitStatus,
    consecutive_failures: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerCore {
    fn closed() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// How a call was let through the gate. Only the probe may decide the
/// outcome of a half-open circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Releases the half-open probe slot if the guarded future is dropped
/// before it produced an outcome (cancellation, deadline).
struct ProbeGuard<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    admission: Admission,
    settled: bool,
}

impl<C: Clock> ProbeGuard<'_, C> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<C: Clock> Drop for ProbeGuard<'_, C> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.release_probe();
        }
    }
}

/// Consecutive-failure circuit breaker.
///
/// Cloning yields a handle to the same breaker.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    core: Arc<Mutex<BreakerCore>>,
    total_calls: Arc<AtomicU64>,
    rejected_calls: Arc<AtomicU64>,
    times_opened: Arc<AtomicU64>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("status", &core.status)
            .field("consecutive_failures", &core.consecutive_failures)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            core: Arc::clone(&self.core),
            total_calls: Arc::clone(&self.total_calls),
            rejected_calls: Arc::clone(&self.rejected_calls),
            times_opened: Arc::clone(&self.times_opened),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults() -> Self {
        Self::from_parts(CircuitBreakerConfig::default(), Arc::new(SystemClock))
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, Arc::new(clock)))
    }

    /// Assemble a breaker from an already validated config.
    pub(crate) fn from_parts(config: CircuitBreakerConfig, clock: Arc<C>) -> Self {
        Self {
            name: Arc::from("default"),
            config,
            core: Arc::new(Mutex::new(BreakerCore::closed())),
            total_calls: Arc::new(AtomicU64::new(0)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
            times_opened: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Attach a name used in log output (usually the endpoint group).
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    /// Name used in log output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Every error returned by `operation` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Execute an operation, counting only errors matched by
    /// `counts_as_failure` against the circuit.
    ///
    /// Errors that do not count are recorded as a success: the dependency
    /// answered, the request itself was at fault.
    #[instrument(skip_all, fields(breaker = %self.name))]
    pub async fn execute_classified<F, Fut, T, E, P>(
        &self,
        operation: F,
        counts_as_failure: P,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
        P: Fn(&E) -> bool,
    {
        let Some(admission) = self.try_acquire() else {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            debug!("Circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen);
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut guard = ProbeGuard { breaker: self, admission, settled: false };

        let result = operation().await;
        guard.settle();

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.on_failure(admission);
                } else {
                    self.on_success(admission);
                }
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    fn try_acquire(&self) -> Option<Admission> {
        let now = self.clock.now();
        let mut core = self.core.lock();

        match core.status {
            CircuitStatus::Closed => Some(Admission::Normal),
            CircuitStatus::Open => {
                let cooled = core
                    .opened_at
                    .map_or(true, |opened_at| now.duration_since(opened_at) >= self.config.cooldown);
                if !cooled {
                    return None;
                }
                core.status = CircuitStatus::HalfOpen;
                core.probe_in_flight = true;
                drop(core);
                info!(breaker = %self.name, "Circuit breaker half-open, admitting probe");
                Some(Admission::Probe)
            }
            CircuitStatus::HalfOpen => {
                if core.probe_in_flight {
                    None
                } else {
                    core.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut core = self.core.lock();
        match (admission, core.status) {
            (Admission::Probe, CircuitStatus::HalfOpen) => {
                *core = BreakerCore::closed();
                drop(core);
                info!(breaker = %self.name, "Circuit breaker closed after successful probe");
            }
            (Admission::Normal, CircuitStatus::Closed) => {
                core.consecutive_failures = 0;
            }
            // Outcome of a call admitted before the last transition.
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut core = self.core.lock();
        match (admission, core.status) {
            (Admission::Probe, CircuitStatus::HalfOpen) => {
                core.status = CircuitStatus::Open;
                core.consecutive_failures += 1;
                core.opened_at = Some(now);
                core.probe_in_flight = false;
                drop(core);
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, "Circuit breaker reopened after failed probe");
            }
            (Admission::Normal, CircuitStatus::Closed) => {
                core.consecutive_failures += 1;
                let failures = core.consecutive_failures;
                if failures >= self.config.failure_threshold {
                    core.status = CircuitStatus::Open;
                    core.opened_at = Some(now);
                    drop(core);
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    warn!(breaker = %self.name, failures, "Circuit breaker opened");
                }
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut core = self.core.lock();
        if core.status == CircuitStatus::HalfOpen && core.probe_in_flight {
            core.probe_in_flight = false;
            drop(core);
            debug!(breaker = %self.name, "Probe abandoned before completion");
        }
    }

    /// Snapshot of the breaker state
    pub fn state(&self) -> CircuitState {
        let core = self.core.lock();
        CircuitState {
            status: core.status,
            consecutive_failures: core.consecutive_failures,
            opened_at: core.opened_at,
            failure_threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
        }
    }

    /// Current status only
    pub fn status(&self) -> CircuitStatus {
        self.core.lock().status
    }

    /// Counter snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (status, consecutive_failures) = {
            let core = self.core.lock();
            (core.status, core.consecutive_failures)
        };
        CircuitBreakerMetrics {
            status,
            consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Acquire),
            rejected_calls: self.rejected_calls.load(Ordering::Acquire),
            times_opened: self.times_opened.load(Ordering::Acquire),
        }
    }

    /// Force the breaker closed with zero failures
    pub fn reset(&self) {
        *self.core.lock() = BreakerCore::closed();
        info!(breaker = %self.name, "Circuit breaker manually reset to closed state");
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}
