//! Socket protection
//!
//! Every outbound socket must bypass the tunnel, otherwise its traffic is
//! captured again and loops. How that happens is platform policy: a
//! routing mark matched by an `ip rule`, binding to the physical
//! interface, or an external `protect(fd)` callback (Android's
//! `VpnService`). The engine calls the protector exactly once per new
//! socket, before connecting it.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;

use socket2::Socket;
use tracing::debug;

use crate::config::ProtectConfig;

/// Capability that exempts a socket from tunnel routing
pub trait SocketProtector: Send + Sync {
    /// Protect a not-yet-connected socket
    ///
    /// # Errors
    ///
    /// Returns the OS error when the socket cannot be exempted; the
    /// session is not created in that case.
    fn protect(&self, socket: &Socket) -> io::Result<()>;
}

impl<F> SocketProtector for F
where
    F: Fn(&Socket) -> io::Result<()> + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        self(socket)
    }
}

/// Protector that does nothing (routing handled elsewhere, or tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Protector applying `SO_MARK` and/or `SO_BINDTODEVICE`
#[derive(Debug, Clone, Default)]
pub struct RouteProtector {
    routing_mark: Option<u32>,
    bind_interface: Option<String>,
}

impl RouteProtector {
    pub fn new(routing_mark: Option<u32>, bind_interface: Option<String>) -> Self {
        Self {
            routing_mark,
            bind_interface,
        }
    }

    pub fn from_config(config: &ProtectConfig) -> Self {
        Self::new(config.routing_mark, config.bind_interface.clone())
    }

    /// Whether this protector changes anything at all
    pub fn is_noop(&self) -> bool {
        self.routing_mark.is_none() && self.bind_interface.is_none()
    }

    /// Set `SO_BINDTODEVICE` to bind to a specific interface
    fn set_bind_device(socket: &Socket, interface: &str) -> io::Result<()> {
        // Interface name must be null-terminated and fit in IFNAMSIZ (16 bytes)
        if interface.len() > 15 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Interface name too long: {interface} (max 15 chars)"),
            ));
        }

        let mut ifname = [0u8; 16];
        ifname[..interface.len()].copy_from_slice(interface.as_bytes());

        // SAFETY: valid fd, pointer/length describe a live 16-byte buffer
        #[allow(clippy::cast_possible_truncation)]
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                ifname.as_ptr().cast::<libc::c_void>(),
                ifname.len() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        debug!("Bound socket to interface: {}", interface);
        Ok(())
    }

    /// Set `SO_MARK` for policy routing
    fn set_routing_mark(socket: &Socket, mark: u32) -> io::Result<()> {
        // SAFETY: valid fd, pointer/length describe a live u32
        #[allow(clippy::cast_possible_truncation)]
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_MARK,
                std::ptr::addr_of!(mark).cast::<libc::c_void>(),
                mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        debug!("Set routing mark: {}", mark);
        Ok(())
    }
}

impl SocketProtector for RouteProtector {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        if let Some(interface) = &self.bind_interface {
            Self::set_bind_device(socket, interface)?;
        }
        if let Some(mark) = self.routing_mark {
            Self::set_routing_mark(socket, mark)?;
        }
        Ok(())
    }
}
