//! Fleetbook API client
//!
//! HTTP-facing half of the client core: the request pipeline, its error
//! taxonomy, per-call options and the HTTP token refresher.
//!
//! # Architecture
//!
//! - Single-attempt transport from [`crate::http`]; retries live here
//! - Bearer tokens via the single-flight `TokenCoordinator`
//! - Circuit breaker per endpoint group around the retry chain
//! - Opt-in response cache with ETag revalidation for GETs

pub mod auth;
pub mod client;
pub mod errors;
pub mod options;
pub mod response;

pub use auth::{HttpTokenRefresher, DEFAULT_REFRESH_PATH};
pub use client::{ApiClient, ApiClientBuilder, REQUEST_ID_HEADER};
pub use errors::{ApiError, ApiErrorCategory};
pub use options::{CacheOptions, RequestOptions, RetryOverrides};
pub use response::ApiResponse;
pub use reqwest::Method;
