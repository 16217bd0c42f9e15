//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: workers={}, mtu={}, filter={} addresses",
        config.engine.max_workers,
        config.tunnel.mtu,
        config.filter.addresses.len()
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_NAT_LOG_LEVEL`: Override log level
/// - `TUN_NAT_TUN_FD`: Override tunnel file descriptor
/// - `TUN_NAT_MAX_WORKERS`: Override worker pool size
/// - `TUN_NAT_ROUTING_MARK`: Override outbound routing mark
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(level) = std::env::var("TUN_NAT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(fd) = std::env::var("TUN_NAT_TUN_FD") {
        config.tunnel.fd = Some(fd.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_NAT_TUN_FD".into(),
            reason: format!("Invalid file descriptor: {fd}"),
        })?);
        debug!("Tunnel fd overridden to {:?}", config.tunnel.fd);
    }

    if let Ok(workers) = std::env::var("TUN_NAT_MAX_WORKERS") {
        config.engine.max_workers = workers.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_NAT_MAX_WORKERS".into(),
            reason: format!("Invalid number: {workers}"),
        })?;
        debug!("Max workers overridden to {}", config.engine.max_workers);
    }

    if let Ok(mark) = std::env::var("TUN_NAT_ROUTING_MARK") {
        config.protect.routing_mark = Some(mark.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_NAT_ROUTING_MARK".into(),
            reason: format!("Invalid routing mark: {mark}"),
        })?);
        debug!(
            "Routing mark overridden to {:?}",
            config.protect.routing_mark
        );
    }

    // Re-validate after overrides
    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
