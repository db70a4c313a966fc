//! The connection acceptor.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kiln_cache::Cache;
use kiln_io::ScratchRoot;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::limiter::ConnectionLimiter;
use crate::refusal;
use crate::session::{Session, SessionContext};

/// Back-off after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound server: listening socket, shared cache, scratch root and
/// connection limiter.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    limiter: ConnectionLimiter,
    context: Arc<SessionContext>,
    scratch: ScratchRoot,
}

impl Server {
    /// Bind the listening socket and prepare the scratch root and cache.
    ///
    /// A bind failure is [`ServerError::Initialization`] and is not retried.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        let listener =
            TcpListener::bind(&endpoint)
                .await
                .map_err(|source| ServerError::Initialization {
                    address: endpoint.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;

        let scratch =
            ScratchRoot::create(config.scratch_parent.as_deref()).map_err(ServerError::Scratch)?;
        let cache = Cache::open(scratch.path()).await?;

        info!(
            address = %local_addr,
            limit = config.limit,
            timeout_secs = config.compilation_timeout.as_secs(),
            scratch = %scratch.path(),
            "server bound"
        );

        Ok(Self {
            listener,
            local_addr,
            limiter: ConnectionLimiter::new(config.limit),
            context: Arc::new(SessionContext {
                cache: Arc::new(cache),
                scratch: scratch.path().to_path_buf(),
                compilation_timeout: config.compilation_timeout,
                shuffle_seed: config.shuffle_seed,
            }),
            scratch,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// Accept connections until the process exits.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then abort the
    /// running sessions and release the scratch root.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut sessions = JoinSet::new();
        let mut next_session: u64 = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        warn!(error = %e, "session task panicked");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_session += 1;
                        self.admit(&mut sessions, next_session, stream, peer);
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!(active = self.limiter.active(), "shutting down");
        drop(self.listener);
        sessions.shutdown().await;
        self.scratch.release().map_err(ServerError::ScratchRelease)?;
        Ok(())
    }

    /// Hand the connection to a new session, or refuse it when the limit
    /// is reached. The check happens here, before anything is spawned.
    fn admit(&self, sessions: &mut JoinSet<()>, id: u64, mut stream: TcpStream, peer: SocketAddr) {
        let span = info_span!("session", id, peer = %peer);

        match self.limiter.try_acquire() {
            Some(permit) => {
                let context = Arc::clone(&self.context);
                sessions.spawn(
                    async move {
                        let _permit = permit;
                        Session::new(stream, peer, context).run().await;
                    }
                    .instrument(span),
                );
            }
            None => {
                let limit = self.limiter.limit();
                info!(
                    peer = %peer,
                    limit,
                    "not accepting new connection, as the connection limit is reached"
                );
                sessions.spawn(
                    async move {
                        let reason = format!("Limit {limit} reached");
                        if let Err(e) = refusal::refuse(&mut stream, &reason).await {
                            debug!(error = %e, "refusal handshake failed");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr;
        let limiter = self.limiter.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            // A dropped sender also means shut down
            let _ = shutdown_rx.await;
        }));

        ServerHandle {
            local_addr,
            limiter,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Control handle for a server started with [`Server::spawn`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    limiter: ConnectionLimiter,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live session count.
    pub fn active_connections(&self) -> usize {
        self.limiter.active()
    }

    /// Stop accepting, abort running sessions and release the scratch root.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
        }
    }
}
