//! Concurrent session table
//!
//! Maps session keys to shared entries, with a secondary index from the
//! multiplexer token to the key so readiness events find their session
//! without a scan.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mio::Token;
use tracing::{debug, warn};

use super::{SessionEntry, SessionKey, TcpState};
use crate::reactor::MultiplexerHandle;
use crate::stats::EngineStats;

/// First token handed to a session; lower values are reserved for the
/// multiplexer's own sources
const FIRST_SESSION_TOKEN: usize = 1;

/// All live sessions of one engine
///
/// Never call into the table while holding a session lock: `close` takes
/// that lock itself.
pub struct SessionTable {
    sessions: DashMap<SessionKey, Arc<SessionEntry>>,
    tokens: DashMap<Token, SessionKey>,
    next_token: AtomicUsize,
    mux: MultiplexerHandle,
    stats: Arc<EngineStats>,
}

impl SessionTable {
    pub fn new(mux: MultiplexerHandle, stats: Arc<EngineStats>) -> Self {
        Self {
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            next_token: AtomicUsize::new(FIRST_SESSION_TOKEN),
            mux,
            stats,
        }
    }

    /// Allocate a registration token for a new session
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionEntry>> {
        self.sessions.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Look up a session by its canonical string key
    pub fn get_by_key(&self, key: &str) -> Option<Arc<SessionEntry>> {
        let key: SessionKey = key.parse().ok()?;
        self.get(&key)
    }

    /// Look up the session owning a registration token
    pub fn get_by_token(&self, token: Token) -> Option<Arc<SessionEntry>> {
        let key = *self.tokens.get(&token)?.value();
        self.get(&key)
    }

    /// Insert a new session. Returns false, leaving the table untouched,
    /// when the key is already present.
    pub fn put(&self, entry: Arc<SessionEntry>) -> bool {
        let key = *entry.key();
        match self.sessions.entry(key) {
            Entry::Occupied(_) => {
                warn!("Session {} already exists, new entry discarded", key);
                false
            }
            Entry::Vacant(slot) => {
                self.tokens.insert(entry.token(), key);
                slot.insert(entry);
                self.stats.record_session_created();
                debug!("Session {} created", key);
                true
            }
        }
    }

    /// Refresh a session's last-activity time
    pub fn keep_alive(&self, key: &SessionKey) -> bool {
        self.sessions.get(key).map(|e| e.touch()).is_some()
    }

    /// Remove a session and retire its socket.
    ///
    /// Returns true only for the call that actually removed the entry.
    pub fn close(&self, key: &SessionKey) -> bool {
        let Some((_, entry)) = self.sessions.remove(key) else {
            return false;
        };
        self.tokens.remove(&entry.token());
        entry.abort();

        let socket = {
            let mut session = entry.lock();
            if let Some(tcp) = session.tcp.as_mut() {
                tcp.state = TcpState::Closed;
            }
            session.socket.take()
        };
        if let Some(socket) = socket {
            self.mux.retire(entry.token(), socket);
        }

        self.stats.record_session_closed();
        debug!("Session {} closed after {:?} idle", key, entry.idle_for());
        true
    }

    /// Canonical string form of a key
    pub fn create_key(key: &SessionKey) -> String {
        key.encode()
    }

    /// Keys of sessions idle for longer than `timeout`
    pub fn idle_keys(&self, timeout: Duration) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter(|e| e.value().idle_for() > timeout)
            .map(|e| *e.key())
            .collect()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session; returns how many were removed
    pub fn close_all(&self) -> usize {
        self.keys().iter().filter(|key| self.close(key)).count()
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("sessions", &self.sessions.len())
            .field("next_token", &self.next_token)
            .finish_non_exhaustive()
    }
}
