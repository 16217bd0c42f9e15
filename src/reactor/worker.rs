//! Reader and writer jobs
//!
//! A job owns one lease for its whole run. Socket I/O happens under the
//! session lock and never blocks (the sockets are non-blocking); the
//! packets it produces are sent to the tunnel only after the lock is
//! released. When the lease is dropped the job re-checks the cached
//! readiness so that events that arrived meanwhile are not lost.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::MultiplexerHandle;
use crate::packet::TcpFlags;
use crate::session::{
    OutboundSocket, ReadLease, Session, SessionEntry, SessionTable, TcpState, WriteLease,
};
use crate::stats::EngineStats;
use crate::tunnel::TunnelSink;

/// Bytes read from a stream per syscall
const STREAM_READ_CHUNK: usize = 16 * 1024;

/// Largest datagram we can receive
const MAX_DATAGRAM: usize = 64 * 1024;

/// Everything a job needs besides its session
pub struct WorkerContext {
    pub table: Arc<SessionTable>,
    pub sink: Arc<dyn TunnelSink>,
    pub mux: MultiplexerHandle,
    pub stats: Arc<EngineStats>,
    pub receive_window: u16,
    pub max_receive_buffer: usize,
}

/// One unit of I/O work for a session
#[derive(Debug)]
pub enum Job {
    /// Drain the socket towards the tunnel
    Read(ReadLease),
    /// Drain the outbound queue into the socket (or clean up an aborting
    /// session)
    Write(WriteLease),
    /// Reset the tunnel side of a session whose connect failed
    Reset(WriteLease),
}

impl Job {
    fn entry(&self) -> &Arc<SessionEntry> {
        match self {
            Self::Read(lease) => lease.entry(),
            Self::Write(lease) | Self::Reset(lease) => lease.entry(),
        }
    }

    pub async fn run(self, ctx: &WorkerContext) {
        let entry = Arc::clone(self.entry());
        let packets = match &self {
            Self::Read(_) => read_ready(&entry, ctx),
            Self::Write(_) => write_ready(&entry, ctx),
            Self::Reset(_) => reset(&entry, ctx),
        };
        deliver(ctx, packets).await;

        drop(self);
        finish(&entry, ctx);
    }
}

async fn deliver(ctx: &WorkerContext, packets: Vec<Bytes>) {
    for packet in packets {
        if let Err(e) = ctx.sink.send_packet(packet).await {
            debug!("Tunnel sink rejected packet: {}", e);
            return;
        }
        ctx.stats.record_packet_out();
    }
}

/// Post-run check, with the lease already released
fn finish(entry: &Arc<SessionEntry>, ctx: &WorkerContext) {
    if entry.is_aborting() {
        ctx.table.close(entry.key());
        return;
    }
    if entry.is_read_pending() || (entry.is_writable() && entry.needs_writer()) {
        ctx.mux.notify(Arc::clone(entry));
    }
}

fn reset(entry: &SessionEntry, ctx: &WorkerContext) -> Vec<Bytes> {
    entry.abort();
    let session = entry.lock();
    match session.reset_segment() {
        Some(rst) => {
            ctx.stats.record_reset();
            vec![rst]
        }
        None => Vec::new(),
    }
}

fn read_ready(entry: &SessionEntry, ctx: &WorkerContext) -> Vec<Bytes> {
    if entry.is_aborting() {
        return Vec::new();
    }
    let mut guard = entry.lock();
    let session: &mut Session = &mut guard;
    let result = match session.socket {
        Some(OutboundSocket::Tcp(_)) => read_stream(entry, session, ctx),
        Some(OutboundSocket::Udp(_)) => read_datagrams(session, &ctx.stats),
        None => return Vec::new(),
    };

    match result {
        Ok(packets) => packets,
        Err(e) => {
            debug!("Read from {} failed: {}", entry.key(), e);
            entry.abort();
            let rst = session.reset_segment();
            if rst.is_some() {
                ctx.stats.record_reset();
            }
            rst.into_iter().collect()
        }
    }
}

fn read_stream(
    entry: &SessionEntry,
    session: &mut Session,
    ctx: &WorkerContext,
) -> io::Result<Vec<Bytes>> {
    let mut buf = vec![0u8; STREAM_READ_CHUNK];
    let mut total = 0;
    let eof = session.tcp.as_ref().map_or(true, |t| t.remote_eof);

    while !eof {
        let room = ctx.max_receive_buffer.saturating_sub(session.inbound.len());
        if room == 0 {
            session.read_paused = true;
            trace!("Inbound buffer of {} full, reading paused", entry.key());
            break;
        }
        let Some(OutboundSocket::Tcp(stream)) = session.socket.as_mut() else {
            break;
        };
        let limit = room.min(buf.len());
        match stream.read(&mut buf[..limit]) {
            Ok(0) => {
                if let Some(tcp) = session.tcp.as_mut() {
                    tcp.remote_eof = true;
                }
                debug!("Remote end of {} closed", entry.key());
                break;
            }
            Ok(n) => {
                session.inbound.extend_from_slice(&buf[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    ctx.stats.record_from_remote(total);

    // Our FIN is out: nothing more can be delivered to the peer
    if session.tcp.as_ref().is_some_and(|t| t.fin_sent) {
        session.inbound.clear();
    }

    let packets = flush_stream(session, ctx.receive_window);

    let finished = session.inbound.is_empty()
        && session.outbound_bytes() == 0
        && session
            .tcp
            .as_ref()
            .is_some_and(|t| t.remote_eof && t.state == TcpState::LastAck);
    if finished {
        debug!("Both sides of {} closed", entry.key());
        entry.abort();
    }
    Ok(packets)
}

/// Segment the inbound buffer towards the tunnel, as far as the peer's
/// window allows, and send our FIN once a closed remote has been drained.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn flush_stream(session: &mut Session, receive_window: u16) -> Vec<Bytes> {
    let window = session.advertised_window(receive_window);
    let mut packets = Vec::new();

    while !session.inbound.is_empty() {
        let Some(tcp) = session.tcp.as_ref() else {
            break;
        };
        let len = tcp
            .segment_limit()
            .min(tcp.send_window_available())
            .min(session.inbound.len());
        if len == 0 {
            trace!("Peer window full, {} bytes held", session.inbound.len());
            break;
        }
        let (seq, ack, options) = (tcp.send_next, tcp.recv_next, tcp.segment_options());
        let chunk = session.inbound.split_to(len);
        let flags = if session.inbound.is_empty() {
            TcpFlags::PSH | TcpFlags::ACK
        } else {
            TcpFlags::ACK
        };
        packets.push(session.tcp_segment(flags, seq, ack, window, options, &chunk));
        if let Some(tcp) = session.tcp.as_mut() {
            tcp.send_next = seq.wrapping_add(len as u32);
        }
    }

    let fin_due = session.inbound.is_empty()
        && session
            .tcp
            .as_ref()
            .is_some_and(|t| t.remote_eof && !t.fin_sent);
    if fin_due {
        if let Some(fin) = session.send_fin(window) {
            packets.push(fin);
        }
        if let Some(tcp) = session.tcp.as_mut() {
            if tcp.state != TcpState::LastAck {
                tcp.state = TcpState::Closing;
            }
        }
    }
    packets
}

fn read_datagrams(session: &Session, stats: &EngineStats) -> io::Result<Vec<Bytes>> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut packets = Vec::new();
    let Some(OutboundSocket::Udp(socket)) = session.socket.as_ref() else {
        return Ok(packets);
    };
    loop {
        match socket.recv(&mut buf) {
            Ok(n) => {
                stats.record_from_remote(n);
                packets.push(session.udp_datagram(&buf[..n]));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(packets)
}

fn write_ready(entry: &SessionEntry, ctx: &WorkerContext) -> Vec<Bytes> {
    if entry.is_aborting() {
        return Vec::new();
    }
    let generation = entry.write_generation();
    let mut guard = entry.lock();
    let session: &mut Session = &mut guard;
    match session.socket {
        Some(OutboundSocket::Tcp(_)) => write_stream(entry, session, ctx, generation),
        Some(OutboundSocket::Udp(_)) => {
            write_datagrams(entry, session, &ctx.stats, generation);
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn write_stream(
    entry: &SessionEntry,
    session: &mut Session,
    ctx: &WorkerContext,
    generation: u64,
) -> Vec<Bytes> {
    let window_before = session.advertised_window(ctx.receive_window);
    let mut written = 0;
    let mut failure = None;

    while session.data_ready && session.outbound_bytes() > 0 {
        let data = session.drain_outbound();
        let Some(OutboundSocket::Tcp(stream)) = session.socket.as_mut() else {
            session.requeue_front(data);
            break;
        };
        match stream.write(&data) {
            Ok(0) => {
                session.requeue_front(data);
                failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                break;
            }
            Ok(n) => {
                written += n;
                session.requeue_front(data.slice(n..));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                session.requeue_front(data);
                entry.mark_write_blocked(generation);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => session.requeue_front(data),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    ctx.stats.record_to_remote(written);

    if let Some(e) = failure {
        debug!("Write to {} failed: {}", entry.key(), e);
        entry.abort();
        let rst = session.reset_segment();
        if rst.is_some() {
            ctx.stats.record_reset();
        }
        return rst.into_iter().collect();
    }

    if session.outbound_bytes() == 0 {
        session.data_ready = false;
    }

    if session.needs_write_shutdown() {
        if let Some(OutboundSocket::Tcp(stream)) = session.socket.as_ref() {
            match stream.shutdown(Shutdown::Write) {
                Ok(()) => debug!("Write half of {} shut down", entry.key()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => debug!("Shutdown of {} failed: {}", entry.key(), e),
            }
        }
        if let Some(tcp) = session.tcp.as_mut() {
            tcp.write_shutdown = true;
        }
    }

    // Exchange finished while data was still queued
    let done = session.outbound_bytes() == 0
        && session
            .tcp
            .as_ref()
            .is_some_and(|t| t.state == TcpState::Closed);
    if done {
        entry.abort();
        return Vec::new();
    }

    // Tell a peer that may be stalled on our window that it opened again
    let window_after = session.advertised_window(ctx.receive_window);
    if written > 0 && window_before < ctx.receive_window / 2 && window_after > window_before {
        return session.ack_segment(window_after).into_iter().collect();
    }
    Vec::new()
}

fn write_datagrams(
    entry: &SessionEntry,
    session: &mut Session,
    stats: &EngineStats,
    generation: u64,
) {
    let mut written = 0;
    while let Some(datagram) = session.pop_outbound() {
        let Some(OutboundSocket::Udp(socket)) = session.socket.as_ref() else {
            session.requeue_front(datagram);
            break;
        };
        match socket.send(&datagram) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                session.requeue_front(datagram);
                entry.mark_write_blocked(generation);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => session.requeue_front(datagram),
            Err(e) => {
                debug!("Send to {} failed: {}", entry.key(), e);
                entry.abort();
                break;
            }
        }
    }
    stats.record_to_remote(written);
    if session.outbound_bytes() == 0 {
        session.data_ready = false;
    }
}
