//! Engine statistics
//!
//! Lock-free counters shared by the dispatcher, the multiplexer and the
//! workers, with a serializable snapshot for logging.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic engine statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Packets read from the tunnel
    packets_in: AtomicU64,
    /// Packets written back to the tunnel
    packets_out: AtomicU64,
    /// Packets that failed to parse
    parse_errors: AtomicU64,
    /// Packets with an unsupported IP version or transport
    unsupported: AtomicU64,
    /// Packets dropped by the traffic filter
    filtered: AtomicU64,
    /// Sessions inserted into the table
    sessions_created: AtomicU64,
    /// Sessions removed from the table
    sessions_closed: AtomicU64,
    /// RST segments synthesized towards the tunnel
    resets_sent: AtomicU64,
    /// Payload bytes written to outbound sockets
    bytes_to_remote: AtomicU64,
    /// Payload bytes read from outbound sockets
    bytes_from_remote: AtomicU64,
}

impl EngineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_remote(&self, bytes: usize) {
        self.bytes_to_remote
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_from_remote(&self, bytes: usize) {
        self.bytes_from_remote
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Sessions currently alive according to the counters
    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.sessions_created
            .load(Ordering::Relaxed)
            .saturating_sub(self.sessions_closed.load(Ordering::Relaxed))
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        #[allow(clippy::cast_possible_truncation)]
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        EngineStatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_from_remote: self.bytes_from_remote.load(Ordering::Relaxed),
            timestamp_ms,
        }
    }
}

/// Snapshot of engine statistics at a point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub parse_errors: u64,
    pub unsupported: u64,
    pub filtered: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub resets_sent: u64,
    pub bytes_to_remote: u64,
    pub bytes_from_remote: u64,
    /// Unix timestamp of the snapshot in milliseconds
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = EngineStats::new();
        stats.record_packet_in();
        stats.record_packet_in();
        stats.record_session_created();
        stats.record_session_created();
        stats.record_session_closed();
        stats.record_to_remote(100);
        stats.record_from_remote(250);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_in, 2);
        assert_eq!(snapshot.sessions_created, 2);
        assert_eq!(snapshot.bytes_to_remote, 100);
        assert_eq!(snapshot.bytes_from_remote, 250);
        assert_eq!(stats.active_sessions(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = EngineStats::new();
        stats.record_reset();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"resets_sent\":1"));
    }
}
