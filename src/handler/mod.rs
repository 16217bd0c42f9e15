//! Session handler: the dispatcher for tunnel packets
//!
//! Every packet read from the tunnel goes through
//! [`SessionHandler::handle_packet`]. UDP datagrams are queued on a session
//! with a connected outbound socket. TCP segments drive a small server-side
//! state machine (see [`tcp`]) that answers the handshake, acknowledges
//! data, and tears the connection down.
//!
//! The handler never touches sockets for I/O; it queues payload and asks
//! the multiplexer to schedule a writer.

mod tcp;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::config::EngineConfig;
use crate::error::{PacketError, Result};
use crate::outbound::{self, SocketProtector};
use crate::packet::{protocol_name, Packet, TransportHeader};
use crate::reactor::MultiplexerHandle;
use crate::session::{OutboundSocket, Session, SessionEntry, SessionKey, SessionTable};
use crate::stats::EngineStats;
use crate::tunnel::TunnelSink;

/// What happened to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A new session was created for it
    Created,
    /// Applied to an existing session
    Forwarded,
    /// Answered directly, without a session (courtesy ACK or RST)
    Answered,
    /// The session was closed or marked for teardown
    Closed,
    /// Ignored
    Dropped,
}

/// Dispatcher for packets read from the tunnel
pub struct SessionHandler {
    table: Arc<SessionTable>,
    mux: MultiplexerHandle,
    protector: Arc<dyn SocketProtector>,
    sink: Arc<dyn TunnelSink>,
    stats: Arc<EngineStats>,
    mss: u16,
    receive_window: u16,
}

impl SessionHandler {
    pub fn new(
        table: Arc<SessionTable>,
        mux: MultiplexerHandle,
        protector: Arc<dyn SocketProtector>,
        sink: Arc<dyn TunnelSink>,
        config: &EngineConfig,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            table,
            mux,
            protector,
            sink,
            stats,
            mss: config.mss,
            receive_window: config.receive_window,
        }
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Process one raw IP packet from the tunnel.
    ///
    /// # Errors
    ///
    /// `PacketError` for malformed or unsupported packets (which are
    /// dropped), `TunnelError` when a reply cannot be sent.
    pub async fn handle_packet(&self, data: Bytes) -> Result<Disposition> {
        self.stats.record_packet_in();

        if let Some(version) = data.first().map(|b| b >> 4) {
            if version != 4 && version != 6 {
                self.stats.record_unsupported();
                return Err(PacketError::UnsupportedProtocol {
                    layer: "network",
                    value: version,
                }
                .into());
            }
        }

        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                match e {
                    PacketError::UnsupportedProtocol { .. } => self.stats.record_unsupported(),
                    _ => self.stats.record_parse_error(),
                }
                return Err(e.into());
            }
        };
        trace!(
            "{} {} -> {} ({} bytes)",
            protocol_name(packet.protocol()),
            packet.source(),
            packet.destination(),
            packet.payload.len()
        );

        let mut replies = Vec::new();
        let disposition = match &packet.transport {
            TransportHeader::Tcp(header) => self.handle_tcp(&packet, header, &mut replies),
            TransportHeader::Udp(_) => self.handle_udp(&packet),
        };

        for reply in replies {
            self.sink.send_packet(reply).await?;
            self.stats.record_packet_out();
        }
        Ok(disposition)
    }

    fn handle_udp(&self, packet: &Packet) -> Disposition {
        let key = SessionKey::from_packet(packet);

        if let Some(entry) = self.table.get(&key) {
            entry.touch();
            {
                let mut session = entry.lock();
                session.observe(packet);
                session.enqueue_outbound(packet.payload.clone());
                session.data_ready = true;
            }
            self.mux.notify(entry);
            return Disposition::Forwarded;
        }

        let socket = match outbound::open_datagram(key.destination, self.protector.as_ref()) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Dropping datagram for {}: {}", key, e);
                return Disposition::Dropped;
            }
        };

        let mut session = Session::new(Some(OutboundSocket::Udp(socket)), packet, None);
        session.enqueue_outbound(packet.payload.clone());
        session.data_ready = true;
        let entry = Arc::new(SessionEntry::new(key, self.table.next_token(), session));
        entry.set_connected();
        entry.touch();

        if !self.table.put(Arc::clone(&entry)) {
            return Disposition::Dropped;
        }
        self.mux.register(entry);
        Disposition::Created
    }
}

impl std::fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler")
            .field("sessions", &self.table.len())
            .field("mss", &self.mss)
            .field("receive_window", &self.receive_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunNatError;
    use crate::outbound::NoProtection;
    use crate::packet::test_packets::{tcp_v4, udp};
    use crate::packet::{TcpFlags, TcpOption};
    use crate::reactor::Multiplexer;
    use crate::session::TcpState;
    use std::io;
    use tokio::sync::mpsc;

    struct Fixture {
        handler: SessionHandler,
        rx: mpsc::Receiver<Bytes>,
        handle: MultiplexerHandle,
        _mux: crate::reactor::Multiplexer,
    }

    fn fixture_with(protector: Arc<dyn SocketProtector>) -> Fixture {
        let config = EngineConfig::default();
        let (mux, handle) = Multiplexer::new(&config).unwrap();
        let stats = Arc::new(EngineStats::new());
        let table = Arc::new(SessionTable::new(handle.clone(), Arc::clone(&stats)));
        let (tx, rx) = mpsc::channel(64);
        let handler = SessionHandler::new(
            table,
            handle.clone(),
            protector,
            Arc::new(tx),
            &config,
            stats,
        );
        Fixture {
            handler,
            rx,
            handle,
            _mux: mux,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoProtection))
    }

    fn reply(rx: &mut mpsc::Receiver<Bytes>) -> Packet {
        Packet::parse(rx.try_recv().expect("reply expected")).unwrap()
    }

    fn tcp_reply(rx: &mut mpsc::Receiver<Bytes>) -> crate::packet::TcpHeader {
        reply(rx).transport.as_tcp().unwrap().clone()
    }

    const CLIENT: &str = "10.0.0.2:40000";

    /// SYN towards a local listener; returns the listener, its address
    /// and our ISN
    async fn handshake(fx: &mut Fixture) -> (std::net::TcpListener, String, u32) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = listener.local_addr().unwrap().to_string();
        let syn = tcp_v4(
            CLIENT,
            &remote,
            1000,
            0,
            TcpFlags::SYN,
            vec![TcpOption::MaxSegmentSize(1460)],
            b"",
        );
        assert_eq!(
            fx.handler.handle_packet(syn).await.unwrap(),
            Disposition::Created
        );
        let syn_ack = tcp_reply(&mut fx.rx);
        let ack = tcp_v4(
            CLIENT,
            &remote,
            1001,
            syn_ack.sequence.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"",
        );
        assert_eq!(
            fx.handler.handle_packet(ack).await.unwrap(),
            Disposition::Forwarded
        );
        (listener, remote, syn_ack.sequence)
    }

    fn session_key(remote: &str) -> SessionKey {
        SessionKey::new(CLIENT.parse().unwrap(), remote.parse().unwrap(), 6)
    }

    #[tokio::test]
    async fn test_unsupported_ip_version() {
        let fx = fixture();
        let err = fx
            .handler
            .handle_packet(Bytes::from_static(&[0x50; 40]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TunNatError::Packet(PacketError::UnsupportedProtocol {
                layer: "network",
                value: 5,
            })
        ));
        assert_eq!(fx.handler.stats().snapshot().unsupported, 1);
    }

    #[tokio::test]
    async fn test_malformed_packet() {
        let fx = fixture();
        let err = fx
            .handler
            .handle_packet(Bytes::from_static(&[0x45, 0, 0]))
            .await
            .unwrap_err();
        assert!(matches!(err, TunNatError::Packet(PacketError::MalformedHeader(_))));
        assert!(fx.handler.handle_packet(Bytes::new()).await.is_err());
        assert_eq!(fx.handler.stats().snapshot().parse_errors, 2);
    }

    #[tokio::test]
    async fn test_udp_creates_then_forwards() {
        let fx = fixture();
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = server.local_addr().unwrap().to_string();

        let first = fx
            .handler
            .handle_packet(udp(CLIENT, &remote, b"one"))
            .await
            .unwrap();
        assert_eq!(first, Disposition::Created);
        let second = fx
            .handler
            .handle_packet(udp(CLIENT, &remote, b"two"))
            .await
            .unwrap();
        assert_eq!(second, Disposition::Forwarded);

        let key = SessionKey::new(CLIENT.parse().unwrap(), remote.parse().unwrap(), 17);
        let entry = fx.handler.table().get(&key).unwrap();
        assert!(entry.is_connected());
        let session = entry.lock();
        assert_eq!(session.outbound.len(), 2);
        assert!(session.has_pending_write());
        // Register + notify
        assert_eq!(fx.handle.pending_commands(), 2);
    }

    #[tokio::test]
    async fn test_syn_ack_options() {
        let mut fx = fixture();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = listener.local_addr().unwrap().to_string();
        let syn = tcp_v4(
            CLIENT,
            &remote,
            7000,
            0,
            TcpFlags::SYN,
            vec![
                TcpOption::MaxSegmentSize(1400),
                TcpOption::WindowScale(7),
                TcpOption::Timestamps {
                    value: 42,
                    echo_reply: 0,
                },
            ],
            b"",
        );
        assert_eq!(
            fx.handler.handle_packet(syn.clone()).await.unwrap(),
            Disposition::Created
        );

        let packet = reply(&mut fx.rx);
        assert_eq!(packet.source(), remote.parse().unwrap());
        assert_eq!(packet.destination(), CLIENT.parse().unwrap());
        let syn_ack = packet.transport.as_tcp().unwrap();
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.acknowledgment, 7001);
        assert_eq!(syn_ack.mss(), Some(1460));
        assert_eq!(syn_ack.window_scale(), Some(0));
        assert_eq!(syn_ack.timestamps().map(|(_, echo)| echo), Some(42));

        // Retransmitted SYN gets the same ISN
        assert_eq!(
            fx.handler.handle_packet(syn).await.unwrap(),
            Disposition::Forwarded
        );
        assert_eq!(tcp_reply(&mut fx.rx).sequence, syn_ack.sequence);

        let entry = fx.handler.table().get(&session_key(&remote)).unwrap();
        assert_eq!(
            entry.lock().tcp.as_ref().unwrap().state,
            TcpState::SynReceived
        );
    }

    #[tokio::test]
    async fn test_syn_on_synchronized_session_gets_challenge_ack() {
        let mut fx = fixture();
        let (_listener, remote, isn) = handshake(&mut fx).await;
        let key = session_key(&remote);

        let data = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"abcd",
        );
        fx.handler.handle_packet(data).await.unwrap();
        assert_eq!(tcp_reply(&mut fx.rx).acknowledgment, 1005);

        // New connection attempt reusing the live flow
        let syn = tcp_v4(CLIENT, &remote, 5000, 0, TcpFlags::SYN, vec![], b"");
        assert_eq!(
            fx.handler.handle_packet(syn.clone()).await.unwrap(),
            Disposition::Answered
        );
        let ack = tcp_reply(&mut fx.rx);
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!(ack.sequence, isn.wrapping_add(1));
        assert_eq!(ack.acknowledgment, 1005);
        {
            let entry = fx.handler.table().get(&key).unwrap();
            let session = entry.lock();
            let tcp = session.tcp.as_ref().unwrap();
            assert_eq!(tcp.state, TcpState::Established);
            assert_eq!(tcp.recv_next, 1005);
        }

        let fin = tcp_v4(
            CLIENT,
            &remote,
            1005,
            isn.wrapping_add(1),
            TcpFlags::FIN | TcpFlags::ACK,
            vec![],
            b"",
        );
        fx.handler.handle_packet(fin).await.unwrap();
        assert_eq!(tcp_reply(&mut fx.rx).flags, TcpFlags::FIN | TcpFlags::ACK);

        assert_eq!(
            fx.handler.handle_packet(syn).await.unwrap(),
            Disposition::Answered
        );
        let ack = tcp_reply(&mut fx.rx);
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!(ack.sequence, isn.wrapping_add(2));
        assert_eq!(ack.acknowledgment, 1006);
        assert!(fx.rx.try_recv().is_err());

        let entry = fx.handler.table().get(&key).unwrap();
        assert_eq!(entry.lock().tcp.as_ref().unwrap().state, TcpState::LastAck);
        assert_eq!(fx.handler.table().len(), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_resets() {
        let protector = |_: &socket2::Socket| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        };
        let mut fx = fixture_with(Arc::new(protector));
        let syn = tcp_v4(CLIENT, "127.0.0.1:9", 500, 0, TcpFlags::SYN, vec![], b"");
        assert_eq!(
            fx.handler.handle_packet(syn).await.unwrap(),
            Disposition::Answered
        );

        let rst = tcp_reply(&mut fx.rx);
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst.acknowledgment, 501);
        assert!(fx.handler.table().is_empty());

        // UDP setup failure drops the datagram
        let datagram = udp(CLIENT, "127.0.0.1:9", b"x");
        assert_eq!(
            fx.handler.handle_packet(datagram).await.unwrap(),
            Disposition::Dropped
        );
    }

    #[tokio::test]
    async fn test_stray_segments() {
        let mut fx = fixture();
        let data = tcp_v4(
            CLIENT,
            "1.2.3.4:80",
            100,
            9000,
            TcpFlags::ACK | TcpFlags::PSH,
            vec![],
            b"hello",
        );
        assert_eq!(
            fx.handler.handle_packet(data).await.unwrap(),
            Disposition::Answered
        );
        let rst = tcp_reply(&mut fx.rx);
        assert!(rst.flags.is_rst());
        assert_eq!(rst.sequence, 9000);

        let fin = tcp_v4(
            CLIENT,
            "1.2.3.4:80",
            100,
            9000,
            TcpFlags::FIN | TcpFlags::ACK,
            vec![],
            b"abc",
        );
        assert_eq!(
            fx.handler.handle_packet(fin).await.unwrap(),
            Disposition::Answered
        );
        let ack = tcp_reply(&mut fx.rx);
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!(ack.acknowledgment, 104);

        let rst = tcp_v4(CLIENT, "1.2.3.4:80", 100, 0, TcpFlags::RST, vec![], b"");
        assert_eq!(
            fx.handler.handle_packet(rst).await.unwrap(),
            Disposition::Dropped
        );
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_acked_and_queued() {
        let mut fx = fixture();
        let (_listener, remote, isn) = handshake(&mut fx).await;
        let key = session_key(&remote);
        let entry = fx.handler.table().get(&key).unwrap();
        assert_eq!(
            entry.lock().tcp.as_ref().unwrap().state,
            TcpState::Established
        );

        // No PSH and below half the window: queued, not yet ready
        let data = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"GET / ",
        );
        fx.handler.handle_packet(data).await.unwrap();
        let ack = tcp_reply(&mut fx.rx);
        assert_eq!(ack.acknowledgment, 1007);
        assert_eq!(ack.sequence, isn.wrapping_add(1));
        assert_eq!(ack.window, 65535 - 6);
        assert!(!entry.lock().data_ready);

        let data = tcp_v4(
            CLIENT,
            &remote,
            1007,
            isn.wrapping_add(1),
            TcpFlags::ACK | TcpFlags::PSH,
            vec![],
            b"HTTP/1.1\r\n",
        );
        fx.handler.handle_packet(data).await.unwrap();
        assert_eq!(tcp_reply(&mut fx.rx).acknowledgment, 1017);
        let session = entry.lock();
        assert!(session.data_ready);
        assert_eq!(session.outbound_bytes(), 16);
    }

    #[tokio::test]
    async fn test_out_of_order_gets_duplicate_ack() {
        let mut fx = fixture();
        let (_listener, remote, isn) = handshake(&mut fx).await;
        let first = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"aaaa",
        );
        fx.handler.handle_packet(first).await.unwrap();
        assert_eq!(tcp_reply(&mut fx.rx).acknowledgment, 1005);

        let gap = tcp_v4(
            CLIENT,
            &remote,
            1100,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"zzzz",
        );
        fx.handler.handle_packet(gap).await.unwrap();
        assert_eq!(tcp_reply(&mut fx.rx).acknowledgment, 1005);

        let retransmit = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"aaaa",
        );
        fx.handler.handle_packet(retransmit).await.unwrap();
        assert_eq!(tcp_reply(&mut fx.rx).acknowledgment, 1005);

        let entry = fx.handler.table().get(&session_key(&remote)).unwrap();
        assert_eq!(entry.lock().outbound_bytes(), 4);
    }

    #[tokio::test]
    async fn test_peer_close_exchange() {
        let mut fx = fixture();
        let (_listener, remote, isn) = handshake(&mut fx).await;
        let key = session_key(&remote);

        let fin = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::FIN | TcpFlags::ACK,
            vec![],
            b"",
        );
        assert_eq!(
            fx.handler.handle_packet(fin).await.unwrap(),
            Disposition::Forwarded
        );
        let fin_ack = tcp_reply(&mut fx.rx);
        assert_eq!(fin_ack.flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(fin_ack.acknowledgment, 1002);
        assert_eq!(fin_ack.sequence, isn.wrapping_add(1));

        let entry = fx.handler.table().get(&key).unwrap();
        assert_eq!(entry.lock().tcp.as_ref().unwrap().state, TcpState::LastAck);
        assert!(entry.needs_writer());

        let last = tcp_v4(
            CLIENT,
            &remote,
            1002,
            isn.wrapping_add(2),
            TcpFlags::ACK,
            vec![],
            b"",
        );
        assert_eq!(
            fx.handler.handle_packet(last).await.unwrap(),
            Disposition::Closed
        );
        assert!(fx.handler.table().get(&key).is_none());
        assert!(entry.is_aborting());
    }

    #[tokio::test]
    async fn test_rst_aborts_session() {
        let mut fx = fixture();
        let (_listener, remote, isn) = handshake(&mut fx).await;
        let rst = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::RST,
            vec![],
            b"",
        );
        assert_eq!(
            fx.handler.handle_packet(rst).await.unwrap(),
            Disposition::Closed
        );
        let entry = fx.handler.table().get(&session_key(&remote)).unwrap();
        assert!(entry.is_aborting());

        // Further segments are ignored until the workers clean up
        let data = tcp_v4(
            CLIENT,
            &remote,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            vec![],
            b"late",
        );
        assert_eq!(
            fx.handler.handle_packet(data).await.unwrap(),
            Disposition::Dropped
        );
    }
}
