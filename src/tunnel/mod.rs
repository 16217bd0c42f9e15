//! Tunnel side of the engine
//!
//! The engine never opens the TUN device itself. It reads packets from any
//! `AsyncRead` (one packet per read, TUN semantics) and hands replies to a
//! [`TunnelSink`]. The binary wires both ends to an already-open tunnel fd.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::error::{TunNatError, TunnelError};
use crate::handler::SessionHandler;

/// Destination for packets synthesized towards the tunnel
#[async_trait]
pub trait TunnelSink: Send + Sync {
    /// Queue one complete IP packet for the tunnel
    ///
    /// # Errors
    ///
    /// `TunnelError::Closed` once the tunnel side has gone away.
    async fn send_packet(&self, packet: Bytes) -> Result<(), TunnelError>;
}

#[async_trait]
impl TunnelSink for mpsc::Sender<Bytes> {
    async fn send_packet(&self, packet: Bytes) -> Result<(), TunnelError> {
        self.send(packet).await.map_err(|_| TunnelError::Closed)
    }
}

/// Address filter applied before packets reach the dispatcher
///
/// An empty filter admits everything. Otherwise a packet passes when its
/// source or destination address is in the set.
#[derive(Debug, Clone, Default)]
pub struct TrafficFilter {
    addresses: HashSet<IpAddr>,
}

impl TrafficFilter {
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Check a raw packet. Packets too short to carry addresses pass, so
    /// the dispatcher reports them as malformed.
    pub fn admits(&self, packet: &[u8]) -> bool {
        if self.addresses.is_empty() {
            return true;
        }
        match packet_addresses(packet) {
            Some((src, dst)) => self.addresses.contains(&src) || self.addresses.contains(&dst),
            None => true,
        }
    }
}

fn packet_addresses(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let src: [u8; 4] = packet[12..16].try_into().ok()?;
            let dst: [u8; 4] = packet[16..20].try_into().ok()?;
            Some((Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into()))
        }
        6 if packet.len() >= 40 => {
            let src: [u8; 16] = packet[8..24].try_into().ok()?;
            let dst: [u8; 16] = packet[24..40].try_into().ok()?;
            Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into()))
        }
        _ => None,
    }
}

/// Pump packets from the tunnel into the dispatcher until shutdown.
///
/// Packets are handled one at a time, in arrival order.
///
/// # Errors
///
/// `TunnelError::Closed` when the reader hits end of file or the sink goes
/// away; `TunnelError::Io` on a read failure.
pub async fn run_tunnel_reader<R>(
    mut reader: R,
    handler: Arc<SessionHandler>,
    filter: TrafficFilter,
    mtu: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; mtu];
    info!(
        "Tunnel reader started (mtu {}, filter {} addresses)",
        mtu,
        filter.addresses.len()
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("Tunnel reader received shutdown signal");
                return Ok(());
            }

            result = reader.read(&mut buf) => {
                let n = match result {
                    Ok(0) => return Err(TunnelError::Closed),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                let packet = Bytes::copy_from_slice(&buf[..n]);
                if !filter.admits(&packet) {
                    handler.stats().record_filtered();
                    trace!("Filtered {} byte packet", n);
                    continue;
                }
                match handler.handle_packet(packet).await {
                    Ok(disposition) => trace!("Packet handled: {:?}", disposition),
                    Err(TunNatError::Tunnel(e)) => return Err(e),
                    Err(e) if e.is_recoverable() => debug!("Packet dropped: {}", e),
                    Err(e) => warn!("Packet dropped: {}", e),
                }
            }
        }
    }
}

/// Write every packet from `rx` to the tunnel, one packet per write
///
/// # Errors
///
/// `TunnelError::Io` when the tunnel write fails.
pub async fn run_tunnel_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = rx.recv().await {
        writer.write_all(&packet).await?;
        writer.flush().await?;
    }
    debug!("Tunnel writer finished, all senders dropped");
    Ok(())
}
