//! Configuration module for tun-nat
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tun_nat::config::{load_config, Config};
//!
//! let config = load_config("/etc/tun-nat/config.json").unwrap();
//! println!("Workers: {}", config.engine.max_workers);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, EngineConfig, FilterConfig, LogConfig, ProtectConfig, TunnelConfig};
