//! HTTP transport
//!
//! A thin wrapper over `reqwest` that performs exactly one attempt per
//! call. Retry, breaking and auth live in the request pipeline.

pub mod client;

pub use client::{HttpClient, HttpClientBuilder};
