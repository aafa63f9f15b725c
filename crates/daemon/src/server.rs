//! Connection acceptor and shutdown coordination.
//!
//! The [`Server`] owns the listening socket and spawns one task per
//! connection on a [`TaskTracker`]. Shutdown is driven by a
//! [`ShutdownCoordinator`]: once its token is cancelled the acceptor stops
//! taking connections and waits for the outstanding sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Framing;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::accounts::{AccountRegistry, QuotaLedger};
use crate::config::Config;
use crate::logging::CONN_TARGET;
use crate::session::SessionHandler;

/// Back-off after a failed `accept`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every session.
pub struct ServerContext {
    registry: Arc<AccountRegistry>,
    ledger: QuotaLedger,
    framing: Framing,
    admin_user: String,
}

impl ServerContext {
    pub fn new(
        registry: Arc<AccountRegistry>,
        framing: Framing,
        admin_user: impl Into<String>,
    ) -> Self {
        let ledger = QuotaLedger::new(Arc::clone(&registry));
        Self {
            registry,
            ledger,
            framing,
            admin_user: admin_user.into(),
        }
    }

    /// Open the registry described by `config` and build a context around it.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = AccountRegistry::from_config(config)?;
        Ok(Self::new(
            Arc::new(registry),
            config.network.framing,
            config.security.admin_user.clone(),
        ))
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Framing used for new connections.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The only account allowed to `stop` the server.
    pub fn admin_user(&self) -> &str {
        &self.admin_user
    }
}

/// Coordinates server shutdown.
///
/// Cloning is cheap; all clones share the same tokens and tracker.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    /// Cancelled when the server should stop accepting.
    shutdown: CancellationToken,
    /// Cancelled when idle sessions should close.
    drain: CancellationToken,
    tracker: TaskTracker,
    drain_timeout: Option<Duration>,
}

impl ShutdownCoordinator {
    /// With `drain_timeout` unset, sessions are never asked to close.
    pub fn new(drain_timeout: Option<Duration>) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            drain: CancellationToken::new(),
            tracker: TaskTracker::new(),
            drain_timeout,
        }
    }

    /// Token observed by the acceptor.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token observed by idle sessions.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Tracker that owns the session tasks.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Begin shutdown. Idempotent.
    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutdown requested");
        }
        self.shutdown.cancel();
    }

    /// Wait until every tracked session has finished.
    ///
    /// Closes the tracker, so no new sessions can be added afterwards. When a
    /// drain timeout is set and expires, idle sessions are asked to close and
    /// the wait continues until they have.
    pub async fn wait(&self) {
        self.tracker.close();
        let remaining = self.tracker.len();
        if remaining > 0 {
            info!(sessions = remaining, "waiting for active sessions");
        }

        match self.drain_timeout {
            None => self.tracker.wait().await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
                    warn!(
                        sessions = self.tracker.len(),
                        "drain timeout expired, closing idle sessions"
                    );
                    self.drain.cancel();
                    self.tracker.wait().await;
                }
            }
        }
    }
}

/// Acceptor tuning.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Upper bound on how long `accept` blocks before shutdown is re-checked.
    pub accept_poll: Duration,
    pub drain_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_millis(1000),
            drain_timeout: None,
        }
    }
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            accept_poll: config.accept_poll(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// The TCP server.
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    coordinator: ShutdownCoordinator,
    accept_poll: Duration,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        context: Arc<ServerContext>,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("Failed to bind listening socket")?;
        Ok(Self {
            listener,
            context,
            coordinator: ShutdownCoordinator::new(options.drain_timeout),
            accept_poll: options.accept_poll,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listening address")
    }

    /// Handle for requesting shutdown from outside the server.
    pub fn coordinator(&self) -> ShutdownCoordinator {
        self.coordinator.clone()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Accept connections until shutdown is requested, then wait for the
    /// outstanding sessions.
    pub async fn run(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!(addr = %local_addr, framing = ?self.context.framing(), "server listening");
        let shutdown = self.coordinator.shutdown_token();

        loop {
            let accept = tokio::time::timeout(self.accept_poll, self.listener.accept());
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = accept => accepted,
            };

            match accepted {
                // Poll interval elapsed.
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    debug!(target: CONN_TARGET, peer = %peer, "accepted connection");
                    let handler = SessionHandler::new(
                        stream,
                        peer,
                        Arc::clone(&self.context),
                        self.coordinator.clone(),
                    );
                    self.coordinator.tracker().spawn(handler.run());
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("no longer accepting connections");
        self.coordinator.wait().await;
        drop(self.listener);
        info!("server stopped");
        Ok(())
    }
}
