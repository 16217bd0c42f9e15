//! Engine assembly
//!
//! [`Engine::start`] wires the pieces together: the session table, the
//! multiplexer thread, the worker pool on the current Tokio runtime and
//! the dispatcher that the tunnel reader feeds.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, TunNatError};
use crate::handler::SessionHandler;
use crate::outbound::SocketProtector;
use crate::reactor::{Multiplexer, MultiplexerHandle, WorkerContext, WorkerPool};
use crate::session::SessionTable;
use crate::stats::EngineStats;
use crate::tunnel::TunnelSink;

const MUX_THREAD_NAME: &str = "tun-nat-mux";

/// A running engine
pub struct Engine {
    handler: Arc<SessionHandler>,
    table: Arc<SessionTable>,
    mux: MultiplexerHandle,
    pool: WorkerPool,
    stats: Arc<EngineStats>,
    mux_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start the engine on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails outside a runtime, or when the poll instance or the
    /// multiplexer thread cannot be created.
    pub fn start(
        config: &EngineConfig,
        protector: Arc<dyn SocketProtector>,
        sink: Arc<dyn TunnelSink>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(io::Error::other)?;
        let stats = Arc::new(EngineStats::new());

        let (multiplexer, mux) = Multiplexer::new(config).map_err(TunNatError::Io)?;
        let table = Arc::new(SessionTable::new(mux.clone(), Arc::clone(&stats)));

        let ctx = Arc::new(WorkerContext {
            table: Arc::clone(&table),
            sink: Arc::clone(&sink),
            mux: mux.clone(),
            stats: Arc::clone(&stats),
            receive_window: config.receive_window,
            max_receive_buffer: config.max_receive_buffer,
        });
        let pool = WorkerPool::new(runtime, config.max_workers, ctx);

        let handler = Arc::new(SessionHandler::new(
            Arc::clone(&table),
            mux.clone(),
            protector,
            sink,
            config,
            Arc::clone(&stats),
        ));

        let mux_thread = {
            let table = Arc::clone(&table);
            let pool = pool.clone();
            thread::Builder::new()
                .name(MUX_THREAD_NAME.into())
                .spawn(move || multiplexer.run(table, pool))
                .map_err(TunNatError::Io)?
        };

        info!(
            "Engine started: {} workers, mss {}, window {}",
            config.max_workers, config.mss, config.receive_window
        );

        Ok(Self {
            handler,
            table,
            mux,
            pool,
            stats,
            mux_thread: Some(mux_thread),
        })
    }

    /// The dispatcher for packets read from the tunnel
    pub fn handler(&self) -> Arc<SessionHandler> {
        Arc::clone(&self.handler)
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Stop the multiplexer, close every session and stop accepting jobs.
    ///
    /// Blocks until the multiplexer thread exits, which takes at most one
    /// poll timeout.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.mux_thread.take() else {
            return;
        };
        self.mux.shutdown();
        if thread.join().is_err() {
            warn!("Multiplexer thread panicked");
        }
        self.pool.close();
        info!("Engine stopped, {} sessions left", self.table.len());
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sessions", &self.table.len())
            .field("pool", &self.pool)
            .field("running", &self.mux_thread.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::NoProtection;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (tx, _rx) = mpsc::channel(16);
        let mut engine = Engine::start(
            &EngineConfig::default(),
            Arc::new(NoProtection),
            Arc::new(tx),
        )
        .unwrap();
        assert!(engine.table().is_empty());

        tokio::task::spawn_blocking(move || {
            engine.shutdown();
            assert!(engine.pool.is_closed());
            // Second call is a no-op
            engine.shutdown();
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_start_requires_runtime() {
        let (tx, _rx) = mpsc::channel(16);
        let err = Engine::start(
            &EngineConfig::default(),
            Arc::new(NoProtection),
            Arc::new(tx),
        )
        .unwrap_err();
        assert!(matches!(err, TunNatError::Io(_)));
    }
}
