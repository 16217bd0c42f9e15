//! Error types for tun-nat
//!
//! This module defines the error hierarchy for the packet codec, session
//! engine, tunnel plumbing and configuration. Errors are grouped by
//! subsystem and carry recovery hints.

use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Top-level error type for tun-nat
#[derive(Debug, Error)]
pub enum TunNatError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet parse or build errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Outbound socket errors
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// Tunnel device errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunNatError {
    /// Check if this error is recoverable (the engine can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Packet(e) => e.is_recoverable(),
            Self::Socket(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Packet codec errors
///
/// These are always surfaced to the caller of the parse/build function.
/// The offending packet is dropped; the engine keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Not enough bytes, bad version nibble, or inconsistent length fields
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// IP version or transport protocol outside {IPv4, IPv6} x {TCP, UDP}
    #[error("Unsupported {layer} protocol: {value}")]
    UnsupportedProtocol { layer: &'static str, value: u8 },

    /// Source and destination belong to different address families
    #[error("Address family mismatch: {src} -> {dst}")]
    AddressFamilyMismatch { src: IpAddr, dst: IpAddr },
}

impl PacketError {
    /// Create a malformed header error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHeader(reason.into())
    }

    /// Create an error for a buffer that is shorter than required
    pub fn truncated(what: &str, needed: usize, available: usize) -> Self {
        Self::MalformedHeader(format!(
            "{what} needs {needed} bytes, only {available} available"
        ))
    }

    /// Packet errors never stop the engine
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Outbound socket errors
///
/// Raised while opening, protecting or connecting the real socket behind
/// a session. During worker I/O these are never returned to the tunnel;
/// they flip the session's abort flag instead.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Failed to create the socket
    #[error("Failed to create socket for {addr}: {source}")]
    Create {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The protector refused or failed to exempt the socket
    #[error("Failed to protect socket for {addr}: {source}")]
    Protect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connect failed immediately or on completion
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    /// The multiplexer could not take the registration
    #[error("Failed to register socket: {0}")]
    Register(String),

    /// Read/write failure on an established socket
    #[error("Socket I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Create a connect error
    pub fn connect(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Connect {
            addr,
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Create { .. } | Self::Protect { .. } | Self::Register(_) => false,
            Self::Connect { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Tunnel device errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel sink or source has been closed
    #[error("Tunnel closed")]
    Closed,

    /// No tunnel file descriptor was configured
    #[error("No tunnel file descriptor configured")]
    NoDevice,

    /// Read/write failure on the tunnel device
    #[error("Tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed | Self::NoDevice => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Result type alias for tun-nat operations
pub type Result<T> = std::result::Result<T, TunNatError>;
