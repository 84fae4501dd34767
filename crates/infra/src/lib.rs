//! # Fleetbook Infrastructure
//!
//! I/O side of the Fleetbook API client core.
//!
//! This crate contains:
//! - The request pipeline ([`ApiClient`])
//! - The reqwest transport
//! - Keyring-backed token persistence
//! - Configuration loading and tracing setup
//!
//! ## Architecture
//! - Composes the breakers, retry, cache and token coordination of
//!   `fleetbook-common`
//! - Contains all "impure" code (network, keyring, filesystem)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod http;
pub mod observability;
pub mod storage;

// Re-export commonly used items
pub use api::{
    ApiClient, ApiClientBuilder, ApiError, ApiErrorCategory, ApiResponse, CacheOptions, Method,
    RequestOptions,
};
pub use config::{ClientConfig, ConfigLoadError};
pub use http::HttpClient;
pub use observability::{init_tracing, ObservabilityError};
pub use storage::KeychainTokenStore;
