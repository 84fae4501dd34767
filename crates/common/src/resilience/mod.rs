//! Resilience patterns for outbound calls
//!
//! - **Circuit Breaker**: stops calling a dependency after repeated failures
//!   and admits a single probe once the cooldown elapses
//! - **Registry**: one breaker per endpoint group, or a single global one
//! - **Retry**: exponential backoff with uniform jitter, cancellable
//!
//! Everything here is generic over the operation error type; the HTTP
//! classification lives with the transport in `fleetbook-infra`.

pub mod circuit_breaker;
pub mod clock;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState, CircuitStatus, ResilienceError, ResilienceResult,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use registry::{endpoint_group, CircuitBreakerRegistry, GLOBAL_GROUP};
pub use retry::{
    policies, RetryConfig, RetryConfigBuilder, RetryContext, RetryDecision, RetryError,
    RetryExecutor, RetryOutcome, RetryPolicy, RetryResult,
};
