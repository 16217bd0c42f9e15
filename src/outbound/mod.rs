//! Outbound sockets
//!
//! Opens the real, non-blocking sockets that carry each session's payload
//! to the remote host. Sockets are built with `socket2` so the protector
//! can act on them before `connect`, then handed to `mio` for readiness.

mod protect;

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::trace;

use crate::error::SocketError;

pub use protect::{NoProtection, RouteProtector, SocketProtector};

/// Idle time before the first keepalive probe on outbound streams
const KEEPALIVE_TIME: std::time::Duration = std::time::Duration::from_secs(60);

/// Interval between keepalive probes
const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

fn new_socket(
    remote: SocketAddr,
    ty: Type,
    protocol: Protocol,
    protector: &dyn SocketProtector,
) -> Result<Socket, SocketError> {
    let socket = Socket::new(Domain::for_address(remote), ty, Some(protocol))
        .map_err(|source| SocketError::Create {
            addr: remote,
            source,
        })?;
    protector
        .protect(&socket)
        .map_err(|source| SocketError::Protect {
            addr: remote,
            source,
        })?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Open a non-blocking stream socket and start connecting it.
///
/// The connect normally completes later; the multiplexer finishes it on
/// the first writable event.
///
/// # Errors
///
/// `SocketError` when the socket cannot be created, protected, or the
/// connect fails immediately.
pub fn open_stream(
    remote: SocketAddr,
    protector: &dyn SocketProtector,
) -> Result<mio::net::TcpStream, SocketError> {
    let socket = new_socket(remote, Type::STREAM, Protocol::TCP, protector)?;
    socket.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    socket.set_tcp_keepalive(&keepalive)?;

    match socket.connect(&remote.into()) {
        Ok(()) => trace!("Stream to {} connected immediately", remote),
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            trace!("Stream to {} connecting", remote);
        }
        Err(e) => return Err(SocketError::connect(remote, e.to_string())),
    }

    Ok(mio::net::TcpStream::from_std(socket.into()))
}

/// Open a non-blocking datagram socket connected to `remote`
///
/// # Errors
///
/// `SocketError` when the socket cannot be created, protected or connected.
pub fn open_datagram(
    remote: SocketAddr,
    protector: &dyn SocketProtector,
) -> Result<mio::net::UdpSocket, SocketError> {
    let socket = new_socket(remote, Type::DGRAM, Protocol::UDP, protector)?;
    socket
        .connect(&remote.into())
        .map_err(|e| SocketError::connect(remote, e.to_string()))?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}
