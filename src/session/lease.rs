//! Read/write leases
//!
//! A lease is the exclusive right to perform one read-drain or one
//! write-drain on a session's socket. Leases are acquired with an atomic
//! compare-exchange and released when dropped, so at most one reader and
//! one writer exist per session at any instant.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::SessionEntry;

/// The two lease flags carried by every entry
#[derive(Debug, Default)]
pub(crate) struct LeaseFlags {
    reading: AtomicBool,
    writing: AtomicBool,
}

impl LeaseFlags {
    fn acquire(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Exclusive read access to a session's socket
#[derive(Debug)]
pub struct ReadLease {
    entry: Arc<SessionEntry>,
}

/// Exclusive write access to a session's socket
#[derive(Debug)]
pub struct WriteLease {
    entry: Arc<SessionEntry>,
}

impl SessionEntry {
    /// Try to take the read lease; `None` if a reader is active
    pub fn try_read_lease(self: &Arc<Self>) -> Option<ReadLease> {
        LeaseFlags::acquire(&self.leases.reading).then(|| ReadLease {
            entry: Arc::clone(self),
        })
    }

    /// Try to take the write lease; `None` if a writer is active
    pub fn try_write_lease(self: &Arc<Self>) -> Option<WriteLease> {
        LeaseFlags::acquire(&self.leases.writing).then(|| WriteLease {
            entry: Arc::clone(self),
        })
    }

    pub fn is_reading(&self) -> bool {
        self.leases.reading.load(Ordering::SeqCst)
    }

    pub fn is_writing(&self) -> bool {
        self.leases.writing.load(Ordering::SeqCst)
    }
}

impl ReadLease {
    pub fn entry(&self) -> &Arc<SessionEntry> {
        &self.entry
    }
}

impl WriteLease {
    pub fn entry(&self) -> &Arc<SessionEntry> {
        &self.entry
    }
}

impl Deref for ReadLease {
    type Target = SessionEntry;

    fn deref(&self) -> &SessionEntry {
        &self.entry
    }
}

impl Deref for WriteLease {
    type Target = SessionEntry;

    fn deref(&self) -> &SessionEntry {
        &self.entry
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        self.entry.leases.reading.store(false, Ordering::SeqCst);
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.entry.leases.writing.store(false, Ordering::SeqCst);
    }
}
