//! tun-nat: userspace NAT for a TUN device
//!
//! IP packets read from a tunnel are terminated locally. Every TCP
//! connection and UDP flow seen on the tunnel is mapped to a real socket
//! towards the destination, and the remote side's traffic is wrapped back
//! into IP packets for the tunnel. The TCP side is a minimal server-role
//! stack: it answers handshakes, acknowledges data and drives the teardown,
//! leaving retransmission to the peer.
//!
//! # Architecture
//!
//! ```text
//! TUN fd → tunnel reader → SessionHandler ──queue──→ outbound socket
//!                               │                         │
//!                          SessionTable            Multiplexer (mio)
//!                                                         │
//! TUN fd ← tunnel writer ←── TunnelSink ←── WorkerPool (read/write jobs)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_nat::config::load_config;
//! use tun_nat::outbound::RouteProtector;
//! use tun_nat::Engine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-nat/config.json")?;
//! let (tx, mut rx) = tokio::sync::mpsc::channel(config.tunnel.queue_capacity);
//!
//! let protector = Arc::new(RouteProtector::from_config(&config.protect));
//! let engine = Engine::start(&config.engine, protector, Arc::new(tx))?;
//!
//! // Feed packets read from the tunnel into the dispatcher...
//! # let packet = bytes::Bytes::new();
//! engine.handler().handle_packet(packet).await?;
//! // ...and write every packet from `rx` back to it.
//! # let _ = rx.recv().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`engine`]: Wiring of the components
//! - [`error`]: Error types
//! - [`handler`]: Dispatcher and TCP state machine
//! - [`outbound`]: Outbound socket creation and protection
//! - [`packet`]: IPv4/IPv6/TCP/UDP codec
//! - [`reactor`]: Readiness multiplexer and worker pool
//! - [`session`]: Session state and table
//! - [`tunnel`]: Tunnel reader/writer and the reply sink

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod outbound;
pub mod packet;
pub mod reactor;
pub mod session;
pub mod stats;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, EngineConfig};
pub use engine::Engine;
pub use error::{ConfigError, PacketError, SocketError, TunNatError, TunnelError};
pub use handler::{Disposition, SessionHandler};
pub use packet::Packet;
pub use session::{SessionKey, SessionTable};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use tunnel::{TrafficFilter, TunnelSink};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
