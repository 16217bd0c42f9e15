//! Readiness multiplexer
//!
//! One `mio::Poll` loop on a dedicated thread owns every socket
//! registration. Other contexts talk to it only through a
//! [`MultiplexerHandle`]: commands go onto a lock-free queue and a
//! `mio::Waker` interrupts the current wait.
//!
//! mio readiness is edge-triggered, so the loop caches readiness in the
//! session entry (`read_pending`, writable generation) and hands ready
//! sessions to the worker pool. A session is only ever given to one reader
//! and one writer at a time (see [`crate::session::ReadLease`]).

mod pool;
mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use mio::event::Event;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::session::{OutboundSocket, SessionEntry, SessionTable};

pub use pool::WorkerPool;
pub use worker::{Job, WorkerContext};

/// Token of the waker; session tokens start above it
const WAKE_TOKEN: Token = Token(0);

/// Pause after a failed wait before trying again
const POLL_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Upper bound between two idle sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Register(Arc<SessionEntry>),
    Retire { token: Token, socket: OutboundSocket },
    Notify(Arc<SessionEntry>),
}

struct Shared {
    commands: SegQueue<Command>,
    waker: Waker,
    /// A wake-up is already in flight
    woken: AtomicBool,
    shutdown: AtomicBool,
}

/// Cloneable handle for submitting work to the multiplexer
#[derive(Clone)]
pub struct MultiplexerHandle {
    shared: Arc<Shared>,
}

impl MultiplexerHandle {
    fn push(&self, command: Command) {
        self.shared.commands.push(command);
        self.wake();
    }

    fn wake(&self) {
        if !self.shared.woken.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.shared.waker.wake() {
                warn!("Failed to wake multiplexer: {}", e);
            }
        }
    }

    /// Register the session's socket for readable and writable events
    pub fn register(&self, entry: Arc<SessionEntry>) {
        self.push(Command::Register(entry));
    }

    /// Deregister and close a socket taken out of a closed session
    pub fn retire(&self, token: Token, socket: OutboundSocket) {
        self.push(Command::Retire { token, socket });
    }

    /// Re-evaluate whether the session needs a reader or writer
    pub fn notify(&self, entry: Arc<SessionEntry>) {
        self.push(Command::Notify(entry));
    }

    /// Stop the loop; remaining sessions are closed before `run` returns
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn pending_commands(&self) -> usize {
        self.shared.commands.len()
    }
}

impl std::fmt::Debug for MultiplexerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerHandle")
            .field("pending", &self.shared.commands.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// The poll loop itself; consumed by [`Multiplexer::run`]
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    poll_timeout: Duration,
    idle_timeout: Duration,
}

impl Multiplexer {
    /// Create the poll instance and its handle
    ///
    /// # Errors
    ///
    /// Returns the OS error if the poll or the waker cannot be created.
    pub fn new(config: &EngineConfig) -> io::Result<(Self, MultiplexerHandle)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            commands: SegQueue::new(),
            waker,
            woken: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let handle = MultiplexerHandle {
            shared: Arc::clone(&shared),
        };
        let mux = Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            shared,
            poll_timeout: config.poll_timeout(),
            idle_timeout: config.idle_timeout(),
        };
        Ok((mux, handle))
    }

    /// Run until [`MultiplexerHandle::shutdown`]. Blocks the calling thread.
    pub fn run(mut self, table: Arc<SessionTable>, pool: WorkerPool) {
        info!(
            "Multiplexer started (poll timeout {:?}, idle timeout {:?})",
            self.poll_timeout, self.idle_timeout
        );
        let mut last_sweep = Instant::now();

        loop {
            self.drain_commands(&pool);

            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Multiplexer wait failed: {}", e);
                    std::thread::sleep(POLL_RETRY_DELAY);
                    continue;
                }
            }

            for event in &self.events {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                match table.get_by_token(event.token()) {
                    Some(entry) => Self::on_event(&entry, event, &pool),
                    None => trace!("Event for retired token {:?}", event.token()),
                }
            }

            if last_sweep.elapsed() >= SWEEP_INTERVAL.min(self.idle_timeout) {
                Self::sweep_idle(&table, self.idle_timeout);
                last_sweep = Instant::now();
            }
        }

        let closed = table.close_all();
        self.drain_commands(&pool);
        info!("Multiplexer stopped, {} sessions closed", closed);
    }

    fn drain_commands(&self, pool: &WorkerPool) {
        self.shared.woken.store(false, Ordering::SeqCst);
        while let Some(command) = self.shared.commands.pop() {
            match command {
                Command::Register(entry) => self.register(&entry, pool),
                Command::Retire { token, socket } => self.retire(token, socket),
                Command::Notify(entry) => evaluate(&entry, pool),
            }
        }
    }

    fn register(&self, entry: &Arc<SessionEntry>, pool: &WorkerPool) {
        let result = {
            let mut session = entry.lock();
            match session.socket.as_mut() {
                Some(socket) => self.poll.registry().register(
                    socket,
                    entry.token(),
                    Interest::READABLE | Interest::WRITABLE,
                ),
                // Closed before the registration got here
                None => return,
            }
        };
        match result {
            Ok(()) => {
                trace!("Registered {} as {:?}", entry.key(), entry.token());
                evaluate(entry, pool);
            }
            Err(e) => {
                warn!("Failed to register {}: {}", entry.key(), e);
                entry.abort();
                evaluate(entry, pool);
            }
        }
    }

    fn retire(&self, token: Token, mut socket: OutboundSocket) {
        if let Err(e) = self.poll.registry().deregister(&mut socket) {
            trace!("Deregister {:?} failed: {}", token, e);
        }
        if let Err(e) = socket.shutdown() {
            debug!("Closing {} socket {:?} failed: {}", socket.kind(), token, e);
        }
    }

    fn on_event(entry: &Arc<SessionEntry>, event: &Event, pool: &WorkerPool) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            entry.mark_read_pending();
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            entry.mark_writable();
        }

        if !entry.is_connected() && !entry.is_aborting() {
            match finish_connect(entry) {
                Ok(true) => {
                    debug!("Outbound stream for {} connected", entry.key());
                    entry.set_connected();
                }
                Ok(false) => return,
                Err(e) => {
                    debug!("Outbound connect for {} failed: {}", entry.key(), e);
                    if entry.abort() {
                        if let Some(lease) = entry.try_write_lease() {
                            pool.submit(Job::Reset(lease));
                            return;
                        }
                    }
                }
            }
        }

        evaluate(entry, pool);
    }

    fn sweep_idle(table: &SessionTable, timeout: Duration) {
        let idle = table.idle_keys(timeout);
        if idle.is_empty() {
            return;
        }
        let evicted = idle.iter().filter(|key| table.close(key)).count();
        debug!("Evicted {} idle sessions", evicted);
    }
}

/// Check whether a pending stream connect has completed.
///
/// `Ok(false)` while it is still in progress.
fn finish_connect(entry: &SessionEntry) -> io::Result<bool> {
    let session = entry.lock();
    let Some(OutboundSocket::Tcp(stream)) = session.socket.as_ref() else {
        // Datagram sockets are connected when created
        return Ok(true);
    };
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Submit whatever reader or writer the session needs right now
pub(crate) fn evaluate(entry: &Arc<SessionEntry>, pool: &WorkerPool) {
    if entry.is_aborting() {
        // The writer finds nothing to do and performs the cleanup
        if let Some(lease) = entry.try_write_lease() {
            pool.submit(Job::Write(lease));
        }
        return;
    }
    if !entry.is_connected() {
        return;
    }

    if entry.is_writable() && !entry.is_writing() && entry.needs_writer() {
        if let Some(lease) = entry.try_write_lease() {
            pool.submit(Job::Write(lease));
        }
    }

    if entry.is_read_pending() {
        if let Some(lease) = entry.try_read_lease() {
            if lease.take_read_pending() {
                pool.submit(Job::Read(lease));
            }
        }
    }
}
