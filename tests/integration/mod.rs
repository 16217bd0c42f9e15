//! Integration tests for tun-nat
//!
//! # Test Organization
//!
//! - `udp_echo`: datagram flows relayed through the engine
//! - `tcp_handshake`: handshake, data transfer and both teardown directions
//!
//! The [`TestTunnel`] harness stands in for the TUN device: packets are
//! handed straight to the dispatcher and replies are collected from the
//! sink channel.

pub mod tcp_handshake;
pub mod udp_echo;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use tun_nat::outbound::NoProtection;
use tun_nat::packet::{
    build_tcp_packet, build_udp_packet, IpHeader, TcpFlags, TcpHeader, TcpOption, IPPROTO_TCP,
    IPPROTO_UDP,
};
use tun_nat::{Disposition, Engine, EngineConfig, Packet};

/// Upper bound for any single reply to show up
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel-side address of the simulated client
pub const CLIENT: &str = "10.0.0.2";

pub struct TestTunnel {
    pub engine: Engine,
    rx: mpsc::Receiver<Bytes>,
}

impl TestTunnel {
    pub fn start() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let engine = Engine::start(&config, Arc::new(NoProtection), Arc::new(tx))
            .expect("engine should start");
        Self { engine, rx }
    }

    /// Feed one packet as if read from the tunnel
    pub async fn send(&self, packet: Bytes) -> Disposition {
        self.engine
            .handler()
            .handle_packet(packet)
            .await
            .expect("packet should be accepted")
    }

    /// Next packet written towards the tunnel
    pub async fn recv(&mut self) -> Packet {
        let data = tokio::time::timeout(REPLY_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a tunnel packet")
            .expect("sink closed");
        Packet::parse(data).expect("engine emitted a malformed packet")
    }

    /// Next TCP segment, skipping pure ACKs without payload or flags of
    /// interest (window updates)
    pub async fn recv_segment(&mut self) -> (TcpHeader, Bytes) {
        loop {
            let packet = self.recv().await;
            let tcp = packet.transport.as_tcp().expect("expected TCP").clone();
            let pure_ack = tcp.flags == TcpFlags::ACK && packet.payload.is_empty();
            if !pure_ack {
                return (tcp, packet.payload);
            }
        }
    }

    /// Next TCP segment, pure ACKs included
    pub async fn recv_tcp(&mut self) -> (TcpHeader, Bytes) {
        let packet = self.recv().await;
        let tcp = packet.transport.as_tcp().expect("expected TCP").clone();
        (tcp, packet.payload)
    }

    /// Packet already written towards the tunnel, if any
    pub fn pending_packet(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Wait until the session table is empty
    pub async fn wait_for_no_sessions(&self) {
        let wait = async {
            while !self.engine.table().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(REPLY_TIMEOUT, wait)
            .await
            .expect("sessions were not cleaned up");
    }
}

pub fn addr(ip: &str, port: u16) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), port)
}

pub fn tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    options: Vec<TcpOption>,
    payload: &[u8],
) -> Bytes {
    let mut tcp = TcpHeader::new(src.port(), dst.port(), seq, ack, flags, 65535);
    tcp.set_options(options).unwrap();
    let template = IpHeader::new(src.ip(), dst.ip(), IPPROTO_TCP, 0).unwrap();
    build_tcp_packet(&template, &mut tcp, payload)
}

pub fn udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Bytes {
    let template = IpHeader::new(src.ip(), dst.ip(), IPPROTO_UDP, 0).unwrap();
    build_udp_packet(&template, src.port(), dst.port(), payload)
}
