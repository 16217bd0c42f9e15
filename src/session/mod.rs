//! Sessions: one entry per proxied connection
//!
//! A [`SessionEntry`] is shared by `Arc` between the dispatcher, the
//! multiplexer and the workers. Its immutable identity (key, token) and the
//! coordination flags live on the entry as atomics; the mutable connection
//! state lives in a [`Session`] behind a `parking_lot::Mutex`. The mutex is
//! only ever held for short, non-blocking sections and never across an
//! `.await` or a table operation.

mod lease;
mod table;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{AddrParseError, Shutdown, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mio::event::Source;
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::packet::{
    build_tcp_packet, build_udp_packet, protocol_name, IpHeader, Packet, TcpFlags, TcpHeader,
    TcpOption, TransportHeader, IPPROTO_TCP, IPPROTO_UDP,
};

pub use lease::{ReadLease, WriteLease};
pub use table::SessionTable;

/// Overhead subtracted from the peer MSS when segmenting data back to
/// the tunnel (IP + TCP headers with room for options)
pub const SEGMENT_OVERHEAD: u16 = 60;

/// Default MSS assumed when the peer's SYN carries none
pub const DEFAULT_PEER_MSS: u16 = 536;

/// Session key: the 5-tuple as seen on the tunnel side
///
/// `source` is the local application, `destination` the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub protocol: u8,
}

impl SessionKey {
    pub fn new(source: SocketAddr, destination: SocketAddr, protocol: u8) -> Self {
        Self {
            source,
            destination,
            protocol,
        }
    }

    /// Key of the connection a packet belongs to
    pub fn from_packet(packet: &Packet) -> Self {
        Self::new(packet.source(), packet.destination(), packet.protocol())
    }

    /// Key with source and destination swapped
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self::new(self.destination, self.source, self.protocol)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IPPROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == IPPROTO_UDP
    }

    pub fn protocol_name(&self) -> &'static str {
        protocol_name(self.protocol)
    }

    /// Canonical string form: `srcIP:srcPort,dstIP:dstPort::protocol`.
    ///
    /// IPv6 addresses are bracketed so the encoding stays reversible.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}::{}", self.source, self.destination, self.protocol)
    }
}

/// Error parsing a canonical session key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionKeyError {
    #[error("session key is missing the '{0}' separator")]
    MissingSeparator(&'static str),
    #[error("invalid address in session key: {0}")]
    Address(#[from] AddrParseError),
    #[error("invalid protocol in session key: {0}")]
    Protocol(String),
}

impl FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoints, protocol) = s
            .rsplit_once("::")
            .ok_or(SessionKeyError::MissingSeparator("::"))?;
        let (source, destination) = endpoints
            .split_once(',')
            .ok_or(SessionKeyError::MissingSeparator(","))?;
        let protocol = protocol
            .parse()
            .map_err(|_| SessionKeyError::Protocol(protocol.to_string()))?;
        Ok(Self::new(source.parse()?, destination.parse()?, protocol))
    }
}

/// TCP connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN-ACK sent, waiting for the peer's first ACK or data
    SynReceived,
    /// Data flowing in both directions
    Established,
    /// Remote closed; our FIN-ACK is out, waiting for the peer
    Closing,
    /// Peer closed; our FIN-ACK is out, waiting for the final ACK
    LastAck,
    /// Exchange finished, about to be removed
    Closed,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SynReceived => write!(f, "SYN_RECEIVED"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::Closing => write!(f, "CLOSING"),
            Self::LastAck => write!(f, "LAST_ACK"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// `a < b` in sequence space (RFC 1982)
#[allow(clippy::cast_possible_wrap)]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Result of validating an inbound acknowledgment number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Acknowledges new data
    Advanced,
    /// Same as the last accepted acknowledgment
    Duplicate,
    /// Regresses below `last_acked` or covers data never sent
    Rejected,
}

/// TCP bookkeeping for one session
#[derive(Debug, Clone)]
pub struct TcpControl {
    pub state: TcpState,
    /// Our initial sequence number (kept for SYN-ACK retransmission)
    pub initial_seq: u32,
    /// Next sequence number we will send
    pub send_next: u32,
    /// Highest sequence number the peer has acknowledged
    pub last_acked: u32,
    /// Next sequence number expected from the peer (our ACK number)
    pub recv_next: u32,
    /// Peer's receive window in bytes, scale applied
    pub peer_window: u32,
    /// Window-scale shift the peer announced (0 when not negotiated)
    pub peer_window_shift: u8,
    pub peer_mss: u16,
    /// Whether the peer sent the timestamps option on its SYN
    pub timestamps: bool,
    /// Most recent peer TSval, echoed back as TSecr
    pub ts_recent: u32,
    /// Set once the first data segment was accepted
    pub data_seen: bool,
    pub fin_sent: bool,
    pub fin_received: bool,
    /// Remote socket write half already shut down
    pub write_shutdown: bool,
    /// Remote host closed its side; FIN goes out once `inbound` drains
    pub remote_eof: bool,
    epoch: Instant,
}

impl TcpControl {
    /// Control block for a session answering the peer's SYN
    pub fn from_syn(syn: &TcpHeader, initial_seq: u32) -> Self {
        let peer_window_shift = syn.window_scale().map_or(0, |s| s.min(14));
        let timestamps = syn.timestamps();
        Self {
            state: TcpState::SynReceived,
            initial_seq,
            send_next: initial_seq.wrapping_add(1),
            last_acked: initial_seq,
            recv_next: syn.sequence.wrapping_add(1),
            // The window in a SYN is never scaled
            peer_window: u32::from(syn.window),
            peer_window_shift,
            peer_mss: syn.mss().unwrap_or(DEFAULT_PEER_MSS),
            timestamps: timestamps.is_some(),
            ts_recent: timestamps.map_or(0, |(value, _)| value),
            data_seen: false,
            fin_sent: false,
            fin_received: false,
            write_shutdown: false,
            remote_eof: false,
            epoch: Instant::now(),
        }
    }

    /// Largest payload per segment sent back to the tunnel
    pub fn segment_limit(&self) -> usize {
        usize::from(self.peer_mss.saturating_sub(SEGMENT_OVERHEAD).max(1))
    }

    /// Bytes in flight towards the peer
    pub fn in_flight(&self) -> u32 {
        self.send_next.wrapping_sub(self.last_acked)
    }

    /// How much more the peer's window admits
    pub fn send_window_available(&self) -> usize {
        self.peer_window.saturating_sub(self.in_flight()) as usize
    }

    /// Validate an acknowledgment and update the send side on success
    pub fn accept_ack(&mut self, ack: u32, window: u16) -> AckOutcome {
        if seq_lt(ack, self.last_acked) || seq_lt(self.send_next, ack) {
            return AckOutcome::Rejected;
        }
        self.peer_window = u32::from(window) << self.peer_window_shift;
        if ack == self.last_acked {
            AckOutcome::Duplicate
        } else {
            self.last_acked = ack;
            AckOutcome::Advanced
        }
    }

    /// Record the peer's TSval from an inbound segment
    pub fn observe_timestamps(&mut self, header: &TcpHeader) {
        if let Some((value, _)) = header.timestamps() {
            if self.timestamps {
                self.ts_recent = value;
            }
        }
    }

    /// Our TSval: milliseconds since the session started
    #[allow(clippy::cast_possible_truncation)]
    pub fn ts_value(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Options carried on every non-SYN segment we send
    pub fn segment_options(&self) -> Vec<TcpOption> {
        if self.timestamps {
            vec![
                TcpOption::NoOp,
                TcpOption::NoOp,
                TcpOption::Timestamps {
                    value: self.ts_value(),
                    echo_reply: self.ts_recent,
                },
            ]
        } else {
            Vec::new()
        }
    }

    /// Options for our SYN-ACK
    pub fn syn_ack_options(&self, mss: u16, peer_offered_scale: bool) -> Vec<TcpOption> {
        let mut options = vec![TcpOption::MaxSegmentSize(mss)];
        if peer_offered_scale {
            // Shift 0: we never scale our own window, but announcing the
            // option enables the peer's scaling
            options.push(TcpOption::NoOp);
            options.push(TcpOption::WindowScale(0));
        }
        if self.timestamps {
            options.push(TcpOption::NoOp);
            options.push(TcpOption::NoOp);
            options.push(TcpOption::Timestamps {
                value: self.ts_value(),
                echo_reply: self.ts_recent,
            });
        }
        options
    }
}

/// The real socket behind a session
#[derive(Debug)]
pub enum OutboundSocket {
    Tcp(mio::net::TcpStream),
    Udp(mio::net::UdpSocket),
}

impl OutboundSocket {
    /// Close both halves where that is meaningful
    ///
    /// # Errors
    ///
    /// Propagates the shutdown error; `NotConnected` is ignored.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            Self::Udp(_) => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "stream",
            Self::Udp(_) => "datagram",
        }
    }
}

impl Source for OutboundSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Udp(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Udp(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Udp(s) => s.deregister(registry),
        }
    }
}

/// Mutable state of one session, guarded by the entry's mutex
#[derive(Debug)]
pub struct Session {
    /// Outbound socket; `None` once the session has been retired
    pub socket: Option<OutboundSocket>,
    /// Last IP header seen from the tunnel (reply template source)
    pub last_ip: IpHeader,
    /// Last transport header seen from the tunnel
    pub last_transport: TransportHeader,
    /// Payload waiting to be written to the remote socket.
    /// UDP keeps one item per datagram.
    pub outbound: VecDeque<Bytes>,
    outbound_bytes: usize,
    /// Bytes read from the remote, waiting for the tunnel
    pub inbound: BytesMut,
    /// Reader stopped because `inbound` hit its cap; an ACK resumes it
    pub read_paused: bool,
    /// Outbound data has been marked ready to send
    pub data_ready: bool,
    /// TCP bookkeeping; `None` for UDP sessions
    pub tcp: Option<TcpControl>,
}

impl Session {
    pub fn new(socket: Option<OutboundSocket>, packet: &Packet, tcp: Option<TcpControl>) -> Self {
        Self {
            socket,
            last_ip: packet.ip.clone(),
            last_transport: packet.transport.clone(),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            inbound: BytesMut::new(),
            read_paused: false,
            data_ready: false,
            tcp,
        }
    }

    /// Remember the latest headers from the tunnel
    pub fn observe(&mut self, packet: &Packet) {
        self.last_ip = packet.ip.clone();
        self.last_transport = packet.transport.clone();
    }

    pub fn enqueue_outbound(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.outbound_bytes += data.len();
        self.outbound.push_back(data);
    }

    /// Put back the unwritten tail of a partial write
    pub fn requeue_front(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.outbound_bytes += data.len();
        self.outbound.push_front(data);
    }

    pub fn pop_outbound(&mut self) -> Option<Bytes> {
        let item = self.outbound.pop_front()?;
        self.outbound_bytes -= item.len();
        Some(item)
    }

    /// Take the whole queue as one contiguous buffer
    pub fn drain_outbound(&mut self) -> Bytes {
        match self.outbound.len() {
            0 => Bytes::new(),
            1 => self.pop_outbound().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.outbound_bytes);
                for chunk in self.outbound.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                self.outbound_bytes = 0;
                joined.freeze()
            }
        }
    }

    pub fn outbound_bytes(&self) -> usize {
        self.outbound_bytes
    }

    pub fn has_pending_write(&self) -> bool {
        self.data_ready && self.outbound_bytes > 0
    }

    /// Peer FIN seen, queue drained, remote write half still open
    pub fn needs_write_shutdown(&self) -> bool {
        self.outbound_bytes == 0
            && self
                .tcp
                .as_ref()
                .is_some_and(|t| t.fin_received && !t.write_shutdown)
    }

    /// Whether a writer job has anything to do
    pub fn needs_writer(&self) -> bool {
        self.has_pending_write() || self.needs_write_shutdown()
    }

    /// Receive window we advertise: room left in the outbound queue
    pub fn advertised_window(&self, receive_window: u16) -> u16 {
        let free = usize::from(receive_window).saturating_sub(self.outbound_bytes);
        u16::try_from(free).unwrap_or(u16::MAX)
    }

    /// Build a TCP segment from the remote towards the tunnel, using the
    /// swapped template headers
    pub fn tcp_segment(
        &self,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        window: u16,
        options: Vec<TcpOption>,
        payload: &[u8],
    ) -> Bytes {
        let reply = self.last_transport.reply();
        let mut header = TcpHeader::new(
            reply.source_port(),
            reply.destination_port(),
            seq,
            ack,
            flags,
            window,
        );
        // A rejected option set leaves the header without options
        if let Err(e) = header.set_options(options) {
            warn!("Sending segment without options: {}", e);
        }
        build_tcp_packet(&self.last_ip.reply(), &mut header, payload)
    }

    /// Pure ACK at the current send/receive position
    pub fn ack_segment(&self, window: u16) -> Option<Bytes> {
        let tcp = self.tcp.as_ref()?;
        Some(self.tcp_segment(
            TcpFlags::ACK,
            tcp.send_next,
            tcp.recv_next,
            window,
            tcp.segment_options(),
            &[],
        ))
    }

    /// Our FIN|ACK; advances `send_next` past it. `None` when already sent.
    pub fn send_fin(&mut self, window: u16) -> Option<Bytes> {
        let tcp = self.tcp.as_ref().filter(|t| !t.fin_sent)?;
        let (seq, ack, options) = (tcp.send_next, tcp.recv_next, tcp.segment_options());
        let packet = self.tcp_segment(
            TcpFlags::FIN | TcpFlags::ACK,
            seq,
            ack,
            window,
            options,
            &[],
        );
        let tcp = self.tcp.as_mut()?;
        tcp.send_next = seq.wrapping_add(1);
        tcp.fin_sent = true;
        Some(packet)
    }

    /// RST|ACK at the current position
    pub fn reset_segment(&self) -> Option<Bytes> {
        let tcp = self.tcp.as_ref()?;
        Some(self.tcp_segment(
            TcpFlags::RST | TcpFlags::ACK,
            tcp.send_next,
            tcp.recv_next,
            0,
            Vec::new(),
            &[],
        ))
    }

    /// Build a UDP datagram from the remote towards the tunnel
    pub fn udp_datagram(&self, payload: &[u8]) -> Bytes {
        let reply = self.last_transport.reply();
        build_udp_packet(
            &self.last_ip.reply(),
            reply.source_port(),
            reply.destination_port(),
            payload,
        )
    }
}

/// Shared handle to one session
#[derive(Debug)]
pub struct SessionEntry {
    key: SessionKey,
    token: Token,
    created: Instant,
    /// Milliseconds since `created` at the last activity
    last_activity_ms: AtomicU64,
    aborting: AtomicBool,
    connected: AtomicBool,
    /// Readable event seen and not yet handed to a reader
    read_pending: AtomicBool,
    /// Writable events seen so far (edge-triggered readiness)
    writable_events: AtomicU64,
    /// `writable_events` value at the start of the last write that hit
    /// `WouldBlock`
    blocked_at: AtomicU64,
    pub(crate) leases: lease::LeaseFlags,
    state: Mutex<Session>,
}

impl SessionEntry {
    pub fn new(key: SessionKey, token: Token, session: Session) -> Self {
        Self {
            key,
            token,
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            aborting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            read_pending: AtomicBool::new(false),
            writable_events: AtomicU64::new(0),
            blocked_at: AtomicU64::new(0),
            leases: lease::LeaseFlags::default(),
            state: Mutex::new(session),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Lock the mutable state. Keep the guard short-lived.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock()
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    /// Mark the session aborting; returns true for the first caller
    pub fn abort(&self) -> bool {
        !self.aborting.swap(true, Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn mark_read_pending(&self) {
        self.read_pending.store(true, Ordering::SeqCst);
    }

    pub fn is_read_pending(&self) -> bool {
        self.read_pending.load(Ordering::SeqCst)
    }

    /// Clear the pending-read flag, returning its previous value
    pub fn take_read_pending(&self) -> bool {
        self.read_pending.swap(false, Ordering::SeqCst)
    }

    /// Record a writable readiness event
    pub fn mark_writable(&self) {
        self.writable_events.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot taken by a writer before it touches the socket
    pub fn write_generation(&self) -> u64 {
        self.writable_events.load(Ordering::SeqCst)
    }

    /// The write started at `generation` hit `WouldBlock`. A writable event
    /// that arrived in the meantime keeps the socket marked writable.
    pub fn mark_write_blocked(&self, generation: u64) {
        self.blocked_at.fetch_max(generation, Ordering::SeqCst);
    }

    pub fn is_writable(&self) -> bool {
        self.writable_events.load(Ordering::SeqCst) > self.blocked_at.load(Ordering::SeqCst)
    }

    pub fn needs_writer(&self) -> bool {
        self.lock().needs_writer()
    }

    /// Refresh the last-activity time
    pub fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last activity
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }
}
