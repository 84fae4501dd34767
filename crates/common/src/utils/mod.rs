//! Common utility helpers
//!
//! - **[`serde`]**: Serialization helpers for durations in configuration

pub mod serde;

pub use self::serde::{duration_millis, option_duration_millis};
