//! The top-level server: owns the listener, the shared `{activeSessions,
//! draining}` state, and graceful shutdown via a `broadcast::Sender<Signal>`
//! that tells every live session to wind down, followed by a
//! `closeTimeout`-bounded drain with a force-abort fallback for stragglers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;

use smtpd::session::{Handlers, Outcome, SessionConfig, Signal};

use crate::config::ServerConfig;
use crate::error::ListenerError;
use crate::listener::{permit_capacity, Listener};

/// Owns one bound listener and the bookkeeping shared across its
/// sessions. A single socket per `Server`; an embedder wanting multiple
/// ports runs one `Server` per port.
pub struct Server<H: Handlers + 'static> {
    config: Arc<ServerConfig>,
    session_config: Arc<SessionConfig>,
    handlers: Arc<H>,
    active: Arc<Semaphore>,
    session_counter: Arc<AtomicU64>,
    sessions: Arc<Mutex<Vec<JoinHandle<Outcome>>>>,
    shutdown_tx: broadcast::Sender<Signal>,
    accept_task: Mutex<Option<JoinHandle<Result<(), ListenerError>>>>,
    draining: AtomicBool,
}

impl<H: Handlers + 'static> Server<H> {
    #[must_use]
    pub fn new(config: ServerConfig, handlers: Arc<H>) -> Self {
        let config = Arc::new(config);
        let session_config = Arc::new(config.session_config());
        let active = Arc::new(Semaphore::new(permit_capacity(config.max_clients())));
        let (shutdown_tx, _rx) = broadcast::channel(64);
        Self {
            config,
            session_config,
            handlers,
            active,
            session_counter: Arc::new(AtomicU64::new(0)),
            sessions: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
            accept_task: Mutex::new(None),
            draining: AtomicBool::new(false),
        }
    }

    /// Loads `ServerConfig` from a TOML file via
    /// [`ServerConfig::from_file`].
    pub fn from_config(path: &str, handlers: Arc<H>) -> Result<Self, crate::error::ConfigError> {
        Ok(Self::new(ServerConfig::from_file(path)?, handlers))
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Binds the configured socket and spawns its accept loop in the
    /// background, returning the bound address.
    pub async fn listen(&self) -> Result<SocketAddr, ListenerError> {
        let listener = Listener::new(
            Arc::clone(&self.config),
            Arc::clone(&self.session_config),
            Arc::clone(&self.handlers),
            Arc::clone(&self.active),
            Arc::clone(&self.session_counter),
            Arc::clone(&self.sessions),
        );
        let bound = listener.bind().await?;
        let addr = bound.local_addr();

        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(bound.serve(shutdown_rx));
        *self.accept_task.lock().await = Some(handle);

        Ok(addr)
    }

    /// Graceful shutdown: stop
    /// accepting new sockets, broadcast `Signal::Shutdown` so every live
    /// session replies `421` to its next command and exits, wait up to
    /// `closeTimeout` for the drain, then force-abort any stragglers.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.draining.store(true, Ordering::SeqCst);

        // Broadcasting before joining the accept task is safe: the
        // listener's own `select!` is biased toward the shutdown branch,
        // so no further sockets are accepted once it observes this.
        let _ = self.shutdown_tx.send(Signal::Shutdown);

        if let Some(accept_task) = self.accept_task.lock().await.take() {
            accept_task.await??;
        }

        let handles: Vec<JoinHandle<Outcome>> = {
            let mut sessions = self.sessions.lock().await;
            std::mem::take(&mut *sessions)
        };
        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(self.config.close_timeout(), join_all(handles)).await.is_err() {
            tracing::warn!("close_timeout elapsed with sessions still draining; aborting");
            for abort_handle in abort_handles {
                abort_handle.abort();
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn handlers(&self) -> Arc<H> {
        Arc::clone(&self.handlers)
    }

    /// The per-session config narrowed from this server's config, for
    /// embedders that want to drive `smtpd::Session` directly over a
    /// transport they already own (e.g. behind a proxy protocol decoder)
    /// instead of going through [`Server::listen`].
    #[must_use]
    pub fn session_config(&self) -> Arc<SessionConfig> {
        Arc::clone(&self.session_config)
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<Signal> {
        self.shutdown_tx.subscribe()
    }
}
