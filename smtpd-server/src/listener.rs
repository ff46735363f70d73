//! The accept loop for a single bound socket: a `TcpListener` bound
//! once, a `tokio::select!` racing `listener.accept()` against a
//! shutdown broadcast receiver, the `maxClients` permit gate, the
//! implicit-TLS-on-accept path, and spawned per-connection session tasks
//! collected so the shutdown path can await/abort them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use smtpd::connection::Connection;
use smtpd::session::{Handlers, Outcome, Session, SessionConfig, Signal};

use crate::config::ServerConfig;
use crate::error::ListenerError;

/// Sized so that, whether or not an operator configures `maxClients`, the
/// same "wait for every permit to come home" mechanism in
/// [`crate::server::Server::close`] works: unlimited is just a semaphore
/// nobody can ever fully drain except by every session finishing.
pub(crate) fn permit_capacity(max_clients: Option<usize>) -> usize {
    max_clients.unwrap_or(Semaphore::MAX_PERMITS)
}

/// An unbound listener: everything needed to bind and serve a socket,
/// held separately from the bound `TcpListener` itself (which only exists
/// after `bind_all` succeeds).
pub struct Listener<H: Handlers + 'static> {
    addr: SocketAddr,
    server_config: Arc<ServerConfig>,
    session_config: Arc<SessionConfig>,
    handlers: Arc<H>,
    active: Arc<Semaphore>,
    session_counter: Arc<AtomicU64>,
    sessions: Arc<Mutex<Vec<JoinHandle<Outcome>>>>,
}

impl<H: Handlers + 'static> Listener<H> {
    #[must_use]
    pub fn new(
        server_config: Arc<ServerConfig>,
        session_config: Arc<SessionConfig>,
        handlers: Arc<H>,
        active: Arc<Semaphore>,
        session_counter: Arc<AtomicU64>,
        sessions: Arc<Mutex<Vec<JoinHandle<Outcome>>>>,
    ) -> Self {
        Self {
            addr: SocketAddr::new(server_config.host, server_config.port),
            server_config,
            session_config,
            handlers,
            active,
            session_counter,
            sessions,
        }
    }

    /// Binds the configured socket, returning a [`BoundListener`] ready to
    /// `serve`. Split from construction so `Server::listen` can report the
    /// actually-bound address (relevant when `port` is `0`) before the
    /// accept loop starts running.
    pub async fn bind(self) -> Result<BoundListener<H>, ListenerError> {
        let listener = TcpListener::bind(self.addr).await.map_err(|source| ListenerError::Bind {
            addr: self.addr,
            source,
        })?;
        let bound_addr = listener.local_addr()?;
        Ok(BoundListener {
            listener,
            addr: bound_addr,
            inner: self,
        })
    }
}

/// A listener with its socket already bound, ready to accept connections.
pub struct BoundListener<H: Handlers + 'static> {
    listener: TcpListener,
    addr: SocketAddr,
    inner: Listener<H>,
}

impl<H: Handlers + 'static> BoundListener<H> {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the accept loop until a `Signal::Shutdown` broadcast is
    /// received, then stops accepting new sockets and returns; outstanding
    /// sessions are tracked in the shared `sessions` list for the caller
    /// (`Server::close`) to await/abort.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let tls_acceptor = if self.inner.server_config.secure {
            match self.inner.server_config.tls_context.as_ref() {
                Some(tls_context) => Some(Connection::<TcpStream>::build_acceptor(tls_context)?),
                None => None,
            }
        } else {
            None
        };

        loop {
            tokio::select! {
                biased;
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown)) {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.inner
                        .handle_accepted(stream, peer, tls_acceptor.clone(), shutdown.resubscribe())
                        .await;
                }
            }
        }

        Ok(())
    }
}

impl<H: Handlers + 'static> Listener<H> {
    /// The `maxClients` gate (before any reply at all), the implicit-TLS
    /// handshake, then handing the resulting transport to a freshly
    /// spawned [`Session`].
    async fn handle_accepted(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        shutdown: broadcast::Receiver<Signal>,
    ) {
        let permit = match Arc::clone(&self.active).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                reject_too_many_clients(stream).await;
                return;
            }
        };

        let id = self.session_counter.fetch_add(1, Ordering::Relaxed).to_string();
        let session_config = Arc::clone(&self.session_config);
        let handlers = Arc::clone(&self.handlers);

        let handle = tokio::spawn(async move {
            let _permit: OwnedSemaphorePermit = permit;
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let connection = Connection::tls(tls_stream);
                        Session::with_connection(id, peer, connection, true, session_config, handlers)
                            .run(shutdown)
                            .await
                    }
                    Err(_handshake_failed) => Outcome::Eof,
                },
                None => Session::new(id, peer, stream, session_config, handlers).run(shutdown).await,
            }
        });

        self.sessions.lock().await.push(handle);
    }
}

/// Writes `421 Too many connected clients` and closes, with no banner and
/// no session ever allocated.
async fn reject_too_many_clients(mut stream: TcpStream) {
    let _ = stream.write_all(b"421 Too many connected clients\r\n").await;
    let _ = stream.shutdown().await;
}
