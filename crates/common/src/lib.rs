//! Transport-agnostic building blocks of the Fleetbook API client.
//!
//! The request pipeline in `fleetbook-infra` composes these pieces: circuit
//! breakers and retry from [`resilience`], the response cache from
//! [`cache`], and single-flight token refresh from [`auth`].
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error classification, serde helpers
//! - `runtime`: clock, resilience, cache, token coordination (default)
//! - `test-utils`: in-memory token store and scripted refresher

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod auth;
#[cfg(feature = "runtime")]
pub mod cache;
#[cfg(feature = "runtime")]
pub mod resilience;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "runtime")]
pub use auth::{AuthError, TokenCoordinator, TokenRefresher, TokenSet, TokenStore};
#[cfg(feature = "runtime")]
pub use cache::{cache_key, CacheConfig, CacheLookup, ResponseCache};
#[cfg(feature = "foundation")]
pub use error::{ConfigError, ConfigResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStatus,
    Clock, MockClock, ResilienceError, RetryConfig, RetryDecision, RetryError, RetryExecutor,
    RetryPolicy, SystemClock,
};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
