//! TCP side of the dispatcher
//!
//! The engine plays the server role towards the tunnel: it answers the
//! peer's SYN itself, acknowledges in-order data, and synthesizes the
//! FIN exchange. There is no retransmission and no reordering buffer; an
//! out-of-order segment gets a duplicate ACK so the peer resends.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::{Disposition, SessionHandler};
use crate::outbound;
use crate::packet::{build_tcp_packet, Packet, TcpFlags, TcpHeader};
use crate::session::{
    AckOutcome, OutboundSocket, Session, SessionEntry, SessionKey, TcpControl, TcpState,
};

/// Follow-up once the session lock is released
#[derive(Debug, Default)]
struct Step {
    /// Queue changed: let the multiplexer schedule a writer
    notify: bool,
    /// Peer window opened for held inbound data: schedule a reader
    resume_read: bool,
    /// Exchange complete, remove the session
    close: bool,
}

impl SessionHandler {
    pub(super) fn handle_tcp(
        &self,
        packet: &Packet,
        header: &TcpHeader,
        replies: &mut Vec<Bytes>,
    ) -> Disposition {
        let key = SessionKey::from_packet(packet);
        let flags = header.flags;
        let entry = self.table.get(&key);

        if flags.is_rst() {
            let Some(entry) = entry else {
                trace!("RST for unknown session {}", key);
                return Disposition::Dropped;
            };
            debug!("Peer reset {}", key);
            entry.abort();
            self.mux.notify(entry);
            return Disposition::Closed;
        }

        let Some(entry) = entry else {
            if flags.is_syn() && !flags.is_ack() {
                return self.open_session(key, packet, header, replies);
            }
            return self.answer_stray(packet, header, replies);
        };

        entry.touch();
        if entry.is_aborting() {
            return Disposition::Dropped;
        }

        if flags.is_syn() && !flags.is_ack() {
            let session = entry.lock();
            let synchronized = session
                .tcp
                .as_ref()
                .is_some_and(|t| t.state != TcpState::SynReceived);
            if synchronized {
                // SYN in a synchronized state: challenge ACK at the
                // current position, the session stays (RFC 5961 4.2)
                debug!("{} SYN on a synchronized session", key);
                let window = session.advertised_window(self.receive_window);
                replies.extend(session.ack_segment(window));
                return Disposition::Answered;
            }
            // Retransmitted SYN: our SYN-ACK got lost
            replies.extend(self.syn_ack(&session, header));
            return Disposition::Forwarded;
        }

        let step = {
            let mut guard = entry.lock();
            let session: &mut Session = &mut guard;
            session.observe(packet);
            self.advance(&key, session, packet, header, replies)
        };
        self.follow_up(&key, entry, &step)
    }

    fn open_session(
        &self,
        key: SessionKey,
        packet: &Packet,
        syn: &TcpHeader,
        replies: &mut Vec<Bytes>,
    ) -> Disposition {
        let socket = match outbound::open_stream(key.destination, self.protector.as_ref()) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Refusing {}: {}", key, e);
                replies.push(reset_reply(packet, syn));
                self.stats.record_reset();
                return Disposition::Answered;
            }
        };

        let control = TcpControl::from_syn(syn, rand::random());
        let session = Session::new(Some(OutboundSocket::Tcp(socket)), packet, Some(control));
        let syn_ack = self.syn_ack(&session, syn);
        let entry = Arc::new(SessionEntry::new(key, self.table.next_token(), session));
        entry.touch();

        if !self.table.put(Arc::clone(&entry)) {
            return Disposition::Dropped;
        }
        self.mux.register(entry);
        replies.extend(syn_ack);
        debug!("{} {}", key, TcpState::SynReceived);
        Disposition::Created
    }

    fn syn_ack(&self, session: &Session, syn: &TcpHeader) -> Option<Bytes> {
        let tcp = session
            .tcp
            .as_ref()
            .filter(|t| t.state == TcpState::SynReceived)?;
        let options = tcp.syn_ack_options(self.mss, syn.window_scale().is_some());
        Some(session.tcp_segment(
            TcpFlags::SYN | TcpFlags::ACK,
            tcp.initial_seq,
            tcp.recv_next,
            self.receive_window,
            options,
            &[],
        ))
    }

    /// Segment for a connection we hold no state for
    fn answer_stray(
        &self,
        packet: &Packet,
        header: &TcpHeader,
        replies: &mut Vec<Bytes>,
    ) -> Disposition {
        if header.flags.is_fin() {
            let ack = header
                .sequence
                .wrapping_add(payload_len(packet))
                .wrapping_add(1);
            trace!("Courtesy ACK for FIN of unknown {}", packet.source());
            replies.push(stateless_reply(
                packet,
                TcpFlags::ACK,
                header.acknowledgment,
                ack,
            ));
        } else {
            trace!(
                "RST for unknown {} -> {}",
                packet.source(),
                packet.destination()
            );
            replies.push(reset_reply(packet, header));
            self.stats.record_reset();
        }
        Disposition::Answered
    }

    #[allow(clippy::too_many_lines)]
    fn advance(
        &self,
        key: &SessionKey,
        session: &mut Session,
        packet: &Packet,
        header: &TcpHeader,
        replies: &mut Vec<Bytes>,
    ) -> Step {
        let mut step = Step::default();
        let mut exchange_done = false;
        let mut window_moved = false;

        let Some(tcp) = session.tcp.as_mut() else {
            return step;
        };
        tcp.observe_timestamps(header);

        if header.flags.is_ack() {
            match tcp.accept_ack(header.acknowledgment, header.window) {
                AckOutcome::Advanced => {
                    window_moved = true;
                    if tcp.state == TcpState::SynReceived {
                        tcp.state = TcpState::Established;
                        debug!("{} {}", key, tcp.state);
                    }
                }
                AckOutcome::Duplicate => window_moved = true,
                AckOutcome::Rejected => debug!(
                    "{} rejected ack {} (acked {}, next {})",
                    key, header.acknowledgment, tcp.last_acked, tcp.send_next
                ),
            }
            // Final ACK of the peer-initiated close
            if tcp.state == TcpState::LastAck && tcp.fin_sent && tcp.last_acked == tcp.send_next {
                exchange_done = true;
            }
        }

        let len = payload_len(packet);
        let mut accepted = false;
        if len > 0 {
            let in_order =
                (header.sequence == tcp.recv_next || !tcp.data_seen) && !tcp.fin_received;
            if !in_order {
                trace!(
                    "{} out-of-order seq {} (expected {})",
                    key,
                    header.sequence,
                    tcp.recv_next
                );
                let window = session.advertised_window(self.receive_window);
                replies.extend(session.ack_segment(window));
                return step;
            }
            tcp.recv_next = header.sequence.wrapping_add(len);
            tcp.data_seen = true;
            if tcp.state == TcpState::SynReceived {
                tcp.state = TcpState::Established;
                debug!("{} {}", key, tcp.state);
            }
            accepted = true;

            session.enqueue_outbound(packet.payload.clone());
            let half_window = usize::from(self.receive_window) / 2;
            if header.flags.is_psh()
                || session.data_ready
                || session.outbound_bytes() >= half_window
            {
                session.data_ready = true;
                step.notify = true;
            }
        }

        let window = session.advertised_window(self.receive_window);

        if header.flags.is_fin() {
            let Some(tcp) = session.tcp.as_mut() else {
                return step;
            };
            let fin_seq = header.sequence.wrapping_add(len);
            if tcp.fin_received || fin_seq != tcp.recv_next {
                // Retransmitted or early FIN
                replies.extend(session.ack_segment(window));
            } else {
                tcp.recv_next = tcp.recv_next.wrapping_add(1);
                tcp.fin_received = true;
                // The writer half-closes the remote once the queue drains
                session.data_ready = true;
                step.notify = true;
                if tcp.fin_sent {
                    replies.extend(session.ack_segment(window));
                    exchange_done = true;
                } else {
                    tcp.state = TcpState::LastAck;
                    debug!("{} {}", key, tcp.state);
                    replies.extend(session.send_fin(window));
                }
            }
        } else if accepted {
            replies.extend(session.ack_segment(window));
        }

        // Closed remote whose data is all delivered: our FIN is due
        let fin_due = session.inbound.is_empty()
            && session
                .tcp
                .as_ref()
                .is_some_and(|t| t.remote_eof && !t.fin_sent);
        if fin_due {
            replies.extend(session.send_fin(window));
            if let Some(tcp) = session.tcp.as_mut() {
                tcp.state = TcpState::Closing;
            }
        }

        if window_moved && (!session.inbound.is_empty() || session.read_paused) {
            session.read_paused = false;
            step.resume_read = true;
        }

        if exchange_done {
            if session.outbound_bytes() == 0 {
                step.close = true;
            } else {
                // Let the writer drain the queue, then it aborts the session
                debug!(
                    "{} finished with {} bytes queued",
                    key,
                    session.outbound_bytes()
                );
                if let Some(tcp) = session.tcp.as_mut() {
                    tcp.state = TcpState::Closed;
                }
                session.data_ready = true;
                step.notify = true;
            }
        }
        step
    }

    fn follow_up(&self, key: &SessionKey, entry: Arc<SessionEntry>, step: &Step) -> Disposition {
        if step.resume_read {
            entry.mark_read_pending();
        }
        if step.close {
            self.table.close(key);
            return Disposition::Closed;
        }
        if step.notify || step.resume_read {
            self.mux.notify(entry);
        }
        Disposition::Forwarded
    }
}

#[allow(clippy::cast_possible_truncation)]
fn payload_len(packet: &Packet) -> u32 {
    packet.payload.len() as u32
}

/// Reply built from the inbound packet alone
fn stateless_reply(packet: &Packet, flags: TcpFlags, seq: u32, ack: u32) -> Bytes {
    let reply = packet.transport.reply();
    let mut header = TcpHeader::new(
        reply.source_port(),
        reply.destination_port(),
        seq,
        ack,
        flags,
        0,
    );
    build_tcp_packet(&packet.ip.reply(), &mut header, &[])
}

/// RST answering `header` (RFC 793 reset generation)
fn reset_reply(packet: &Packet, header: &TcpHeader) -> Bytes {
    if header.flags.is_ack() {
        return stateless_reply(packet, TcpFlags::RST, header.acknowledgment, 0);
    }
    let mut ack = header.sequence.wrapping_add(payload_len(packet));
    if header.flags.is_syn() {
        ack = ack.wrapping_add(1);
    }
    if header.flags.is_fin() {
        ack = ack.wrapping_add(1);
    }
    stateless_reply(packet, TcpFlags::RST | TcpFlags::ACK, 0, ack)
}
