//! UDP relay through the engine against a loopback echo server

use tokio::net::UdpSocket;

use super::{addr, udp_packet, TestTunnel, CLIENT};
use tun_nat::packet::TransportHeader;
use tun_nat::Disposition;

async fn echo_server() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if socket.send_to(&buf[..n], peer).await.is_err() {
                break;
            }
        }
    });
    local
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_round_trip() {
    let server = echo_server().await;
    let client = addr(CLIENT, 5000);
    let mut tunnel = TestTunnel::start();

    let disposition = tunnel.send(udp_packet(client, server, b"ping")).await;
    assert_eq!(disposition, Disposition::Created);

    let reply = tunnel.recv().await;
    assert_eq!(reply.source(), server);
    assert_eq!(reply.destination(), client);
    assert!(matches!(reply.transport, TransportHeader::Udp(_)));
    assert_eq!(reply.payload.as_ref(), b"ping");

    // Same flow reuses the session
    let disposition = tunnel.send(udp_packet(client, server, b"pong")).await;
    assert_eq!(disposition, Disposition::Forwarded);
    assert_eq!(tunnel.recv().await.payload.as_ref(), b"pong");
    assert_eq!(tunnel.engine.table().len(), 1);

    let stats = tunnel.engine.stats().snapshot();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.bytes_to_remote, 8);
    assert_eq!(stats.bytes_from_remote, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_boundaries_preserved() {
    let server = echo_server().await;
    let client = addr(CLIENT, 5001);
    let mut tunnel = TestTunnel::start();

    let sizes = [1usize, 512, 1400];
    for (i, size) in sizes.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let payload = vec![i as u8; *size];
        tunnel.send(udp_packet(client, server, &payload)).await;
    }

    let mut received = Vec::new();
    for _ in sizes {
        received.push(tunnel.recv().await.payload.len());
    }
    received.sort_unstable();
    assert_eq!(received, sizes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flows_get_separate_sessions() {
    let server = echo_server().await;
    let mut tunnel = TestTunnel::start();

    tunnel
        .send(udp_packet(addr(CLIENT, 6000), server, b"a"))
        .await;
    tunnel
        .send(udp_packet(addr(CLIENT, 6001), server, b"b"))
        .await;
    assert_eq!(tunnel.engine.table().len(), 2);

    let mut replies = Vec::new();
    for _ in 0..2 {
        let reply = tunnel.recv().await;
        replies.push((reply.destination().port(), reply.payload));
    }
    replies.sort();
    assert_eq!(replies[0].0, 6000);
    assert_eq!(replies[0].1.as_ref(), b"a");
    assert_eq!(replies[1].0, 6001);
    assert_eq!(replies[1].1.as_ref(), b"b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refused_remote_closes_session() {
    let closed = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let mut tunnel = TestTunnel::start();

    let disposition = tunnel
        .send(udp_packet(addr(CLIENT, 7000), closed, b"hello?"))
        .await;
    assert_eq!(disposition, Disposition::Created);

    // Port unreachable surfaces as ECONNREFUSED on the connected socket
    tunnel.wait_for_no_sessions().await;
    assert!(tunnel.pending_packet().is_none());
    assert_eq!(tunnel.engine.stats().snapshot().resets_sent, 0);
}
