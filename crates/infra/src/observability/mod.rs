//! Logging setup
//!
//! Components log through `tracing` macros with structured fields. Binaries
//! and test harnesses install a subscriber once via [`init_tracing`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Errors from subscriber installation
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    /// A global subscriber is already installed
    #[error("Tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Build the filter for `config`; `RUST_LOG` takes precedence when set.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ObservabilityError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| ObservabilityError::InvalidFilter {
        filter: config.filter.clone(),
        message: e.to_string(),
    })
}

/// Install the global tracing subscriber.
///
/// # Errors
/// Fails on an invalid filter directive or when a subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ObservabilityError> {
    let filter = build_filter(config)?;
    let json_layer = config.json.then(|| fmt::layer().json().with_current_span(true));
    let text_layer = (!config.json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| ObservabilityError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(filter = %config.filter, json = config.json, "Tracing initialized");
    Ok(())
}
