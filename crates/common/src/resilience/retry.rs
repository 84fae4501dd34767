//! Retry with exponential backoff and uniform jitter
//!
//! [`RetryExecutor`] runs an operation up to `max_attempts` times. After each
//! failure a [`RetryPolicy`] decides whether the error is worth another
//! attempt; the delay before the next attempt is
//! `min(base_delay * multiplier^attempt, max_delay)` plus a uniform jitter in
//! `0..=jitter_max`. Cancellation is observed before every attempt and raced
//! against every backoff sleep, so a cancelled chain never fires another
//! attempt.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ErrorClassification};
use crate::utils::{duration_millis, option_duration_millis};

/// Errors that can occur during retry operations
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All retry attempts have been exhausted; `source` is the final cause
    #[error("All retry attempts exhausted after {attempts} tries")]
    Exhausted { attempts: u32, source: E },

    /// The operation failed with a non-retryable error
    #[error("Operation failed with non-retryable error")]
    NonRetryable { source: E },

    /// The chain was cancelled by its token
    #[error("Retry chain cancelled")]
    Cancelled,

    /// The next backoff would overrun the configured total time
    #[error("Retry timeout exceeded after {elapsed:?}")]
    TimeoutExceeded { elapsed: Duration, source: E },
}

impl<E> RetryError<E> {
    /// The last operation error, if the chain got far enough to produce one
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. }
            | RetryError::NonRetryable { source }
            | RetryError::TimeoutExceeded { source, .. } => Some(source),
            RetryError::Cancelled => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    pub attempts: u32,
    pub total_delay: Duration,
    /// Delay slept before each retry, in order
    pub delays: Vec<Duration>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Determine if the error should be retried and optionally provide a custom
    /// delay
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation with a custom delay
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Upper bound for the exponential term
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay
    #[serde(with = "duration_millis")]
    pub jitter_max: Duration,
    /// Maximum total time to spend retrying
    #[serde(with = "option_duration_millis")]
    pub max_total_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_max: Duration::from_millis(1000),
            max_total_time: None,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be a finite value >= 1.0"));
        }

        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid("base_delay must not exceed max_delay"));
        }

        if self.max_total_time.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("max_total_time must be greater than 0"));
        }

        Ok(())
    }

    /// Exponential term without jitter, capped at `max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Backoff for `attempt` (0-based) plus uniform jitter in `0..=jitter_max`
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff_delay(attempt) + Duration::from_millis(jitter)
    }

    /// Longest a full chain can run when each attempt takes `per_attempt`:
    /// every attempt plus the largest jittered backoff between them.
    ///
    /// With `max_total_time` set, backoff stops once that budget would be
    /// overrun, so the bound is the budget plus one last attempt.
    pub fn max_chain_duration(&self, per_attempt: Duration) -> Duration {
        let attempts = per_attempt.saturating_mul(self.max_attempts);
        let backoff = (0..self.max_attempts.saturating_sub(1)).fold(Duration::ZERO, |acc, i| {
            acc.saturating_add(self.backoff_delay(i)).saturating_add(self.jitter_max)
        });
        let unbounded = attempts.saturating_add(backoff);
        match self.max_total_time {
            Some(budget) => unbounded.min(budget.saturating_add(per_attempt)),
            None => unbounded,
        }
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn jitter_max(mut self, jitter: Duration) -> Self {
        self.config.jitter_max = jitter;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter_max = Duration::ZERO;
        self
    }

    pub fn max_total_time(mut self, duration: Duration) -> Self {
        self.config.max_total_time = Some(duration);
        self
    }

    pub fn unlimited_time(mut self) -> Self {
        self.config.max_total_time = None;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-chain bookkeeping. Lives for one `execute` call.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (0-based)
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Start time of retry sequence
    pub start_time: Instant,
    /// Total accumulated delay across attempts
    pub total_delay: Duration,
    pub delays: Vec<Duration>,
}

impl RetryContext {
    fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            backoff_multiplier: config.backoff_multiplier,
            start_time: Instant::now(),
            total_delay: Duration::ZERO,
            delays: Vec::new(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn advance(&mut self, delay: Duration) {
        self.total_delay += delay;
        self.delays.push(delay);
        self.attempt += 1;
    }

    fn finish<T, E>(self, result: RetryResult<T, E>) -> RetryOutcome<T, E> {
        RetryOutcome {
            result,
            attempts: self.attempt + 1,
            total_delay: self.total_delay,
            delays: self.delays,
        }
    }
}

/// The main retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy }
    }

    /// Create with default configuration
    pub fn with_policy(policy: P) -> Self {
        Self::new(RetryConfig::default(), policy)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation, cancel).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    #[instrument(skip_all, fields(max_attempts = self.config.max_attempts))]
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut context = RetryContext::new(&self.config);

        loop {
            if cancel.is_cancelled() {
                debug!(attempt = context.attempt + 1, "Retry chain cancelled before attempt");
                return context.finish(Err(RetryError::Cancelled));
            }

            let attempt_number = context.attempt + 1;
            debug!(attempt = attempt_number, max_attempts = context.max_attempts, "Executing operation");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return context.finish(Err(RetryError::Cancelled)),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => {
                    if context.attempt > 0 {
                        debug!(retries = context.attempt, "Operation succeeded after retries");
                    }
                    return context.finish(Ok(value));
                }
                Err(error) => error,
            };

            let delay = match self.policy.should_retry(&error, context.attempt) {
                RetryDecision::Stop => {
                    debug!(?error, "Retry policy determined not to retry");
                    return context.finish(Err(RetryError::NonRetryable { source: error }));
                }
                RetryDecision::Retry => self.config.compute_delay(context.attempt),
                RetryDecision::RetryAfter(custom) => custom.min(self.config.max_delay),
            };

            if attempt_number >= context.max_attempts {
                warn!(attempts = attempt_number, ?error, "All retry attempts exhausted");
                return context
                    .finish(Err(RetryError::Exhausted { attempts: attempt_number, source: error }));
            }

            if let Some(max_time) = self.config.max_total_time {
                let elapsed = context.elapsed();
                if elapsed + delay > max_time {
                    warn!(?elapsed, attempts = attempt_number, "Retry time budget exceeded");
                    return context.finish(Err(RetryError::TimeoutExceeded { elapsed, source: error }));
                }
            }

            warn!(
                attempt = attempt_number,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                ?error,
                "Operation failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Retry chain cancelled during backoff");
                    return context.finish(Err(RetryError::Cancelled));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            context.advance(delay);
        }
    }
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Retries errors that classify themselves as transient, honouring a
    /// server-suggested delay when present.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Classified;

    impl<E: ErrorClassification> RetryPolicy<E> for Classified {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if !error.is_retryable() {
                return RetryDecision::Stop;
            }
            match error.retry_after() {
                Some(delay) => RetryDecision::RetryAfter(delay),
                None => RetryDecision::Retry,
            }
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}
