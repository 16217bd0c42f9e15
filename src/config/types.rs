//! Configuration types for tun-nat
//!
//! Configuration is loaded from JSON files and validated at startup. Every
//! section has serde defaults, so an empty object is a valid config.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest MTU every IPv4 host must accept
const MIN_MTU: usize = 576;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Tunnel device settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Session engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// How outbound sockets escape the tunnel
    #[serde(default)]
    pub protect: ProtectConfig,

    /// Address filter applied to tunnel traffic
    #[serde(default)]
    pub filter: FilterConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.engine.validate()?;
        self.protect.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Tunnel device configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Already-open tunnel file descriptor
    #[serde(default)]
    pub fd: Option<i32>,

    /// Largest packet read from the tunnel
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Capacity of the channel feeding the tunnel writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl TunnelConfig {
    /// Validate tunnel configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_MTU || self.mtu > usize::from(u16::MAX) {
            return Err(ConfigError::ValidationError(format!(
                "mtu must be between {MIN_MTU} and 65535, got {}",
                self.mtu
            )));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be greater than 0".into(),
            ));
        }

        if let Some(fd) = self.fd {
            if fd < 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid tunnel fd: {fd}"
                )));
            }
        }

        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            fd: None,
            mtu: default_mtu(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Session engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum I/O jobs running in parallel (default: 2 * num_cpus)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// MSS announced in our SYN-ACK
    #[serde(default = "default_mss")]
    pub mss: u16,

    /// Receive window we advertise to tunnel peers
    #[serde(default = "default_receive_window")]
    pub receive_window: u16,

    /// Cap on bytes buffered from a remote before reading pauses
    #[serde(default = "default_max_receive_buffer")]
    pub max_receive_buffer: usize,

    /// Sessions without activity for this long are evicted
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Upper bound on one multiplexer wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Readiness events fetched per wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl EngineConfig {
    /// Validate engine configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "max_workers must be greater than 0".into(),
            ));
        }

        if self.mss <= crate::session::SEGMENT_OVERHEAD {
            return Err(ConfigError::ValidationError(format!(
                "mss must be greater than {}, got {}",
                crate::session::SEGMENT_OVERHEAD,
                self.mss
            )));
        }

        if self.receive_window == 0 {
            return Err(ConfigError::ValidationError(
                "receive_window must be greater than 0".into(),
            ));
        }

        if self.max_receive_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "max_receive_buffer must be greater than 0".into(),
            ));
        }

        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "idle_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.events_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "events_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get poll timeout as Duration
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            mss: default_mss(),
            receive_window: default_receive_window(),
            max_receive_buffer: default_max_receive_buffer(),
            idle_timeout_secs: default_idle_timeout_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Socket protection configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtectConfig {
    /// Set routing mark (SO_MARK)
    #[serde(default)]
    pub routing_mark: Option<u32>,

    /// Bind to specific interface (SO_BINDTODEVICE)
    #[serde(default)]
    pub bind_interface: Option<String>,
}

impl ProtectConfig {
    /// Validate protection configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Interface name length limit (IFNAMSIZ = 16 on Linux)
        if let Some(ref iface) = self.bind_interface {
            if iface.is_empty() || iface.len() > 15 {
                return Err(ConfigError::ValidationError(format!(
                    "Interface name '{iface}' must be 1 to 15 chars"
                )));
            }
        }
        Ok(())
    }
}

/// Traffic filter configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Only packets to or from these addresses are handled (empty: all)
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format '{other}' (expected json or text)"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_mtu() -> usize {
    1500
}

const fn default_queue_capacity() -> usize {
    1024
}

fn default_max_workers() -> usize {
    num_cpus::get() * 2
}

const fn default_mss() -> u16 {
    1460
}

const fn default_receive_window() -> u16 {
    65535
}

const fn default_max_receive_buffer() -> usize {
    256 * 1024
}

const fn default_idle_timeout_secs() -> u64 {
    300
}

const fn default_poll_timeout_ms() -> u64 {
    250
}

const fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
