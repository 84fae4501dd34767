//! Configuration loader
//!
//! Loads [`ClientConfig`] from a file and environment variables.
//!
//! ## Loading Strategy
//! 1. Start from a config file: `FLEETBOOK_CONFIG` if set, otherwise the
//!    first file found by [`probe_config_paths`], otherwise defaults
//! 2. Overlay any `FLEETBOOK_*` environment variables that are set
//! 3. Validate the result
//!
//! ## Environment Variables
//! - `FLEETBOOK_CONFIG`: Explicit config file path
//! - `FLEETBOOK_API_BASE_URL`: API base URL
//! - `FLEETBOOK_API_REFRESH_PATH`: Refresh endpoint path
//! - `FLEETBOOK_API_TIMEOUT_MS`: Per-attempt timeout in milliseconds
//! - `FLEETBOOK_RETRY_MAX_ATTEMPTS`: Attempts per request, including the first
//! - `FLEETBOOK_RETRY_BASE_DELAY_MS`: First backoff delay in milliseconds
//! - `FLEETBOOK_BREAKER_FAILURE_THRESHOLD`: Consecutive failures before opening
//! - `FLEETBOOK_BREAKER_COOLDOWN_MS`: Open-state cooldown in milliseconds
//! - `FLEETBOOK_BREAKER_PER_ENDPOINT_GROUP`: Scope breakers per endpoint group (true/false)
//! - `FLEETBOOK_CACHE_MAX_ENTRIES`: Cache capacity
//! - `FLEETBOOK_CACHE_DEFAULT_TTL_MS`: Default cache TTL in milliseconds
//! - `FLEETBOOK_LOG_FILTER`: Tracing filter directive
//! - `FLEETBOOK_LOG_JSON`: JSON log output (true/false)
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./fleetbook.json` or `./fleetbook.toml` (current working directory)
//! 2. `./config.json` or `./config.toml` (current working directory)
//! 3. `../fleetbook.json` or `../fleetbook.toml` (parent directory)
//! 4. Relative to executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::ClientConfig;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid {format} in {}: {message}", .path.display())]
    Parse { path: PathBuf, format: &'static str, message: String },

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidEnv { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Validation(#[from] fleetbook_common::error::ConfigError),
}

/// Result alias for configuration loading
pub type Result<T> = std::result::Result<T, ConfigLoadError>;

/// Load configuration with automatic fallback strategy
///
/// # Errors
/// Returns [`ConfigLoadError`] if an explicitly named file is missing, a
/// file or variable cannot be parsed, or the merged result is invalid.
pub fn load() -> Result<ClientConfig> {
    let mut config = match std::env::var_os("FLEETBOOK_CONFIG") {
        Some(path) => read_file(Path::new(&path))?,
        None => match probe_config_paths() {
            Some(path) => read_file(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                ClientConfig::default()
            }
        },
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    tracing::info!(base_url = %config.api.base_url, "Configuration loaded");
    Ok(config)
}

/// Load configuration from defaults plus environment variables only
///
/// # Errors
/// Returns [`ConfigLoadError`] if a variable has an invalid value or the
/// result does not validate.
pub fn load_from_env() -> Result<ClientConfig> {
    let mut config = ClientConfig::default();
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes multiple locations for config files.
/// Supports both JSON and TOML formats (detected by file extension).
///
/// # Errors
/// Returns [`ConfigLoadError`] if no file is found, the format is invalid,
/// or the configuration does not validate.
pub fn load_from_file(path: Option<PathBuf>) -> Result<ClientConfig> {
    let config_path = match path {
        Some(p) => p,
        None => probe_config_paths().ok_or_else(|| {
            ConfigLoadError::Invalid(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    let config = read_file(&config_path)?;
    config.validate()?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.to_path_buf()));
    }

    tracing::info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigLoadError::Io { path: path.to_path_buf(), source })?;

    parse_config(&contents, path)
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
fn parse_config(contents: &str, path: &Path) -> Result<ClientConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents).map_err(|e| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            format: "TOML",
            message: e.to_string(),
        }),
        "json" => serde_json::from_str(contents).map_err(|e| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            format: "JSON",
            message: e.to_string(),
        }),
        _ => Err(ConfigLoadError::UnsupportedFormat(extension.to_string())),
    }
}

/// Probe multiple paths for configuration files
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        candidates.extend(candidates_in(&cwd));
        candidates.extend([cwd.join("../fleetbook.json"), cwd.join("../fleetbook.toml")]);
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.extend(candidates_in(exe_dir));
        }
    }

    candidates.into_iter().find(|path| path.exists())
}

fn candidates_in(dir: &Path) -> [PathBuf; 4] {
    [
        dir.join("fleetbook.json"),
        dir.join("fleetbook.toml"),
        dir.join("config.json"),
        dir.join("config.toml"),
    ]
}

fn apply_env_overrides(config: &mut ClientConfig) -> Result<()> {
    if let Some(url) = env_string("FLEETBOOK_API_BASE_URL") {
        config.api.base_url = url;
    }
    if let Some(path) = env_string("FLEETBOOK_API_REFRESH_PATH") {
        config.api.refresh_path = path;
    }
    if let Some(timeout) = env_millis("FLEETBOOK_API_TIMEOUT_MS")? {
        config.api.request_timeout = timeout;
    }
    if let Some(attempts) = env_parse("FLEETBOOK_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = attempts;
    }
    if let Some(delay) = env_millis("FLEETBOOK_RETRY_BASE_DELAY_MS")? {
        config.retry.base_delay = delay;
    }
    if let Some(threshold) = env_parse("FLEETBOOK_BREAKER_FAILURE_THRESHOLD")? {
        config.circuit_breaker.config.failure_threshold = threshold;
    }
    if let Some(cooldown) = env_millis("FLEETBOOK_BREAKER_COOLDOWN_MS")? {
        config.circuit_breaker.config.cooldown = cooldown;
    }
    if let Some(scoped) = env_bool("FLEETBOOK_BREAKER_PER_ENDPOINT_GROUP") {
        config.circuit_breaker.per_endpoint_group = scoped;
    }
    if let Some(max) = env_parse("FLEETBOOK_CACHE_MAX_ENTRIES")? {
        config.cache.max_entries = Some(max);
    }
    if let Some(ttl) = env_millis("FLEETBOOK_CACHE_DEFAULT_TTL_MS")? {
        config.cache.default_ttl = ttl;
    }
    if let Some(filter) = env_string("FLEETBOOK_LOG_FILTER") {
        config.logging.filter = filter;
    }
    if let Some(json) = env_bool("FLEETBOOK_LOG_JSON") {
        config.logging.json = json;
    }
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigLoadError::InvalidEnv {
                key: key.to_string(),
                message: format!("'{}': {}", raw, e),
            })
        })
        .transpose()
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive).
/// Returns `None` when the variable is not set.
fn env_bool(key: &str) -> Option<bool> {
    env_string(key)
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
