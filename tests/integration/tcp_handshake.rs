//! TCP sessions through the engine against loopback servers

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::{addr, tcp_packet, TestTunnel, CLIENT};
use tun_nat::packet::{TcpFlags, TcpHeader, TcpOption};
use tun_nat::session::TcpState;
use tun_nat::{Disposition, EngineConfig, SessionKey};

const CLIENT_ISN: u32 = 40_000;

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    local
}

/// Server that sends `greeting` and closes
async fn greeting_server(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
        }
    });
    local
}

/// Server that reads `expect` bytes, then aborts the connection with
/// a zero-linger close
async fn resetting_server(expect: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; expect];
            if stream.read_exact(&mut buf).await.is_ok() {
                socket2::SockRef::from(&stream)
                    .set_linger(Some(Duration::ZERO))
                    .unwrap();
            }
        }
    });
    local
}

/// Client half of a connection through the tunnel
struct Connection {
    client: SocketAddr,
    server: SocketAddr,
    /// Our next sequence number
    seq: u32,
    /// Next sequence number expected from the engine
    ack: u32,
}

impl Connection {
    /// Run the three-way handshake and return the SYN-ACK
    async fn open(
        tunnel: &mut TestTunnel,
        client_port: u16,
        server: SocketAddr,
        mss: u16,
    ) -> (Self, TcpHeader) {
        let client = addr(CLIENT, client_port);
        let syn = tcp_packet(
            client,
            server,
            CLIENT_ISN,
            0,
            TcpFlags::SYN,
            vec![TcpOption::MaxSegmentSize(mss)],
            b"",
        );
        assert_eq!(tunnel.send(syn).await, Disposition::Created);

        let (syn_ack, _) = tunnel.recv_segment().await;
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.acknowledgment, CLIENT_ISN.wrapping_add(1));

        let conn = Self {
            client,
            server,
            seq: CLIENT_ISN.wrapping_add(1),
            ack: syn_ack.sequence.wrapping_add(1),
        };
        tunnel.send(conn.segment(TcpFlags::ACK, b"")).await;
        (conn, syn_ack)
    }

    fn segment(&self, flags: TcpFlags, payload: &[u8]) -> bytes::Bytes {
        tcp_packet(
            self.client,
            self.server,
            self.seq,
            self.ack,
            flags,
            vec![],
            payload,
        )
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn send_data(&mut self, tunnel: &TestTunnel, flags: TcpFlags, payload: &[u8]) {
        tunnel.send(self.segment(flags, payload)).await;
        self.seq = self.seq.wrapping_add(payload.len() as u32);
    }

    /// Collect `len` bytes of in-order payload from the engine
    #[allow(clippy::cast_possible_truncation)]
    async fn receive(
        &mut self,
        tunnel: &mut TestTunnel,
        len: usize,
        max_segment: usize,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        while data.len() < len {
            let (header, payload) = tunnel.recv_segment().await;
            assert!(!header.flags.is_rst(), "unexpected reset");
            if payload.is_empty() {
                continue;
            }
            assert_eq!(header.sequence, self.ack, "segments must be contiguous");
            assert!(
                payload.len() <= max_segment,
                "segment of {} bytes",
                payload.len()
            );
            self.ack = self.ack.wrapping_add(payload.len() as u32);
            data.extend_from_slice(&payload);
        }
        data
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_over_tcp() {
    let server = echo_server().await;
    let mut tunnel = TestTunnel::start();
    let (mut conn, syn_ack) = Connection::open(&mut tunnel, 41000, server, 1460).await;
    assert_eq!(syn_ack.mss(), Some(1460));

    conn.send_data(&tunnel, TcpFlags::PSH | TcpFlags::ACK, b"hello")
        .await;
    let echoed = conn.receive(&mut tunnel, 5, 1400).await;
    assert_eq!(echoed, b"hello");

    let stats = tunnel.engine.stats().snapshot();
    assert_eq!(stats.bytes_to_remote, 5);
    assert_eq!(stats.bytes_from_remote, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bulk_transfer_respects_peer_mss() {
    let server = echo_server().await;
    let mut tunnel = TestTunnel::start();
    let (mut conn, _) = Connection::open(&mut tunnel, 41001, server, 1000).await;

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    conn.send_data(&tunnel, TcpFlags::ACK, &payload[..1000])
        .await;
    conn.send_data(&tunnel, TcpFlags::PSH | TcpFlags::ACK, &payload[1000..])
        .await;

    // Peer MSS 1000 minus 60 bytes of headroom
    let echoed = conn.receive(&mut tunnel, payload.len(), 940).await;
    assert_eq!(echoed, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_initiated_close() {
    let server = echo_server().await;
    let mut tunnel = TestTunnel::start();
    let (mut conn, _) = Connection::open(&mut tunnel, 41002, server, 1460).await;

    conn.send_data(&tunnel, TcpFlags::PSH | TcpFlags::ACK, b"bye")
        .await;
    assert_eq!(conn.receive(&mut tunnel, 3, 1400).await, b"bye");

    tunnel
        .send(conn.segment(TcpFlags::FIN | TcpFlags::ACK, b""))
        .await;
    conn.seq = conn.seq.wrapping_add(1);

    let (fin_ack, _) = tunnel.recv_segment().await;
    assert_eq!(fin_ack.flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin_ack.acknowledgment, conn.seq);
    assert_eq!(fin_ack.sequence, conn.ack);
    conn.ack = conn.ack.wrapping_add(1);

    // The remote may already have closed its side; the session is gone
    // either way once the final ACK is in
    let last = tunnel.send(conn.segment(TcpFlags::ACK, b"")).await;
    assert!(matches!(last, Disposition::Closed | Disposition::Answered));
    tunnel.wait_for_no_sessions().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_initiated_close() {
    let server = greeting_server(b"welcome\r\n").await;
    let mut tunnel = TestTunnel::start();
    let (mut conn, _) = Connection::open(&mut tunnel, 41003, server, 1460).await;

    assert_eq!(conn.receive(&mut tunnel, 9, 1400).await, b"welcome\r\n");

    let (fin, _) = tunnel.recv_segment().await;
    assert!(fin.flags.is_fin() && fin.flags.is_ack());
    assert_eq!(fin.sequence, conn.ack);
    conn.ack = conn.ack.wrapping_add(1);

    tunnel.send(conn.segment(TcpFlags::ACK, b"")).await;
    let disposition = tunnel
        .send(conn.segment(TcpFlags::FIN | TcpFlags::ACK, b""))
        .await;
    assert_eq!(disposition, Disposition::Closed);

    let (ack, _) = tunnel.recv_tcp().await;
    assert_eq!(ack.flags, TcpFlags::ACK);
    assert_eq!(ack.acknowledgment, conn.seq.wrapping_add(1));
    assert!(tunnel.engine.table().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refused_connection_is_reset() {
    let refused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut tunnel = TestTunnel::start();
    let syn = tcp_packet(
        addr(CLIENT, 41004),
        refused,
        CLIENT_ISN,
        0,
        TcpFlags::SYN,
        vec![],
        b"",
    );
    tunnel.send(syn).await;

    // Either answered at once or after a SYN-ACK, once the connect fails
    loop {
        let (header, _) = tunnel.recv_segment().await;
        if header.flags.is_rst() {
            assert_eq!(header.acknowledgment, CLIENT_ISN.wrapping_add(1));
            break;
        }
        assert_eq!(header.flags, TcpFlags::SYN | TcpFlags::ACK);
    }
    tunnel.wait_for_no_sessions().await;
    assert!(tunnel.engine.stats().snapshot().resets_sent >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_sees_client_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = listener.local_addr().unwrap();
    let accepted = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut tunnel = TestTunnel::start();
    let (mut conn, _) = Connection::open(&mut tunnel, 41005, server, 1460).await;
    conn.send_data(
        &tunnel,
        TcpFlags::PSH | TcpFlags::ACK,
        b"GET / HTTP/1.0\r\n\r\n",
    )
    .await;
    // FIN half-closes the remote once the queue drains
    tunnel
        .send(conn.segment(TcpFlags::FIN | TcpFlags::ACK, b""))
        .await;

    let received = tokio::time::timeout(super::REPLY_TIMEOUT, accepted)
        .await
        .expect("remote never saw EOF")
        .unwrap();
    assert_eq!(received, b"GET / HTTP/1.0\r\n\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_reset_is_forwarded() {
    let server = resetting_server(5).await;
    let mut tunnel = TestTunnel::start();
    let (mut conn, _) = Connection::open(&mut tunnel, 41006, server, 1460).await;
    conn.send_data(&tunnel, TcpFlags::PSH | TcpFlags::ACK, b"hello")
        .await;

    let (rst, payload) = tunnel.recv_segment().await;
    assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
    assert!(payload.is_empty());
    assert_eq!(rst.sequence, conn.ack);
    assert_eq!(rst.acknowledgment, conn.seq);

    tunnel.wait_for_no_sessions().await;
    assert_eq!(tunnel.engine.stats().snapshot().resets_sent, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_half_closed_session_is_swept() {
    let server = greeting_server(b"bye\r\n").await;
    let config = EngineConfig {
        idle_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let mut tunnel = TestTunnel::with_config(config);
    let (mut conn, _) = Connection::open(&mut tunnel, 41007, server, 1460).await;

    assert_eq!(conn.receive(&mut tunnel, 5, 1400).await, b"bye\r\n");
    let (fin, _) = tunnel.recv_segment().await;
    assert!(fin.flags.is_fin());
    conn.ack = conn.ack.wrapping_add(1);
    tunnel.send(conn.segment(TcpFlags::ACK, b"")).await;

    // The client never sends its FIN; the session waits in Closing
    let key = SessionKey::new(conn.client, conn.server, 6);
    {
        let entry = tunnel.engine.table().get(&key).expect("session kept open");
        let state = entry.lock().tcp.as_ref().map(|t| t.state);
        assert_eq!(state, Some(TcpState::Closing));
    }

    tunnel.wait_for_no_sessions().await;
    assert!(tunnel.pending_packet().is_none());
}
