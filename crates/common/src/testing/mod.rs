//! Testing utilities and helpers
//!
//! - **[`mocks`]**: in-memory [`TokenStore`](crate::auth::TokenStore) and
//!   scripted [`TokenRefresher`](crate::auth::TokenRefresher)
//! - [`MockClock`] re-exported for driving breaker cooldowns and cache TTLs
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//!
//! use fleetbook_common::testing::MockClock;
//!
//! let clock = MockClock::new();
//! clock.advance(Duration::from_secs(5));
//! assert_eq!(clock.elapsed(), Duration::from_secs(5));
//! ```

pub mod mocks;

pub use mocks::{MemoryTokenStore, ScriptedRefresher};

pub use crate::resilience::clock::MockClock;
