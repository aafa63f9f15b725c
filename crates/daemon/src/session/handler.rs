//! Per-connection session state machine.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::messages::{
    AUTHENTICATED, AUTHENTICATION_FAILED, EXIT, INSUFFICIENT_PRIVILEGES, REGISTERED,
    SERVER_STOPPING,
};
use protocol::{AuthAction, AuthRequest, Command, Framing, MessageStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::SessionError;
use crate::files::{receive_upload, send_download, CommandDispatcher, PathGuard};
use crate::logging::{AUDIT_TARGET, AUTH_TARGET, CONN_TARGET};
use crate::server::{ServerContext, ShutdownCoordinator};

/// Reply sent when an authenticated user's root directory is gone.
pub const MISSING_USER_ROOT: &str =
    "Error: Your user data directory does not exist. Please contact support.";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Only `login` and `register` are accepted.
    Unauthenticated,
    /// Logged in; commands run through the user's dispatcher.
    Authenticated(CommandDispatcher),
    /// Terminal.
    Closed,
}

/// What the loop does after a request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Serves one client connection from handshake to disconnect.
pub struct SessionHandler<S> {
    id: Uuid,
    peer: SocketAddr,
    stream: MessageStream<S>,
    context: Arc<ServerContext>,
    coordinator: ShutdownCoordinator,
    state: SessionState,
}

impl<S> SessionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        context: Arc<ServerContext>,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        let framing = context.framing();
        Self::with_framing(stream, peer, framing, context, coordinator)
    }

    /// Create a handler with an explicit framing, ignoring the server default.
    pub fn with_framing(
        stream: S,
        peer: SocketAddr,
        framing: Framing,
        context: Arc<ServerContext>,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            stream: MessageStream::new(stream, framing),
            context,
            coordinator,
            state: SessionState::Unauthenticated,
        }
    }

    /// Serve requests until the client leaves, a fatal error occurs or the
    /// server drains idle sessions.
    pub async fn run(mut self) {
        info!(target: CONN_TARGET, session = %self.id, peer = %self.peer, "client connected");
        let drain = self.coordinator.drain_token();

        loop {
            let next = tokio::select! {
                biased;
                _ = drain.cancelled() => {
                    info!(
                        target: CONN_TARGET,
                        session = %self.id,
                        peer = %self.peer,
                        "closing idle session for shutdown"
                    );
                    break;
                }
                next = self.stream.read_message() => next,
            };

            let flow = match next {
                Ok(None) => {
                    debug!(session = %self.id, "peer closed the connection");
                    break;
                }
                Ok(Some(line)) => self.handle(&line).await,
                Err(e) => Err(SessionError::from(e)),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(err) => {
                    if !self.report(err).await {
                        break;
                    }
                }
            }
        }

        self.state = SessionState::Closed;
        if let Err(e) = self.stream.shutdown().await {
            debug!(session = %self.id, error = %e, "shutdown after session end failed");
        }
        info!(target: CONN_TARGET, session = %self.id, peer = %self.peer, "client disconnected");
    }

    async fn handle(&mut self, line: &str) -> Result<Flow, SessionError> {
        match &self.state {
            SessionState::Unauthenticated => self.authenticate(line).await,
            SessionState::Authenticated(dispatcher) => {
                let dispatcher = dispatcher.clone();
                self.dispatch(&dispatcher, line).await
            }
            SessionState::Closed => Ok(Flow::Close),
        }
    }

    async fn authenticate(&mut self, line: &str) -> Result<Flow, SessionError> {
        let request = AuthRequest::parse(line)?;
        let registry = self.context.registry();
        let username = request.username.as_str();

        let reply = match request.action {
            AuthAction::Login => {
                if !registry.authenticate(username, &request.password) {
                    warn!(
                        target: AUTH_TARGET,
                        session = %self.id,
                        peer = %self.peer,
                        user = %username,
                        "login failed"
                    );
                    return Err(SessionError::Auth(AUTHENTICATION_FAILED.to_string()));
                }
                AUTHENTICATED
            }
            AuthAction::Register => {
                if let Err(e) = registry.register(username, &request.password) {
                    warn!(
                        target: AUTH_TARGET,
                        session = %self.id,
                        peer = %self.peer,
                        user = %username,
                        error = %e,
                        "registration refused"
                    );
                    return Err(e.into());
                }
                REGISTERED
            }
        };

        let root = registry.user_root(username);
        let guard = match PathGuard::new(&root) {
            Ok(guard) => guard,
            Err(e) => {
                error!(
                    session = %self.id,
                    user = %username,
                    root = ?root,
                    error = %e,
                    "user root directory missing"
                );
                self.stream.send_message(MISSING_USER_ROOT).await?;
                return Ok(Flow::Close);
            }
        };

        info!(
            target: AUTH_TARGET,
            session = %self.id,
            peer = %self.peer,
            user = %username,
            action = request.action.as_str(),
            "authenticated"
        );
        self.state = SessionState::Authenticated(CommandDispatcher::new(username, guard));
        self.stream.send_message(reply).await?;
        Ok(Flow::Continue)
    }

    async fn dispatch(
        &mut self,
        dispatcher: &CommandDispatcher,
        line: &str,
    ) -> Result<Flow, SessionError> {
        let command = Command::parse(line)?;
        debug!(session = %self.id, user = %dispatcher.username(), verb = command.verb(), "request");

        if !dispatcher.guard().root().is_dir() {
            error!(
                session = %self.id,
                user = %dispatcher.username(),
                "user root directory disappeared"
            );
            self.stream.send_message(MISSING_USER_ROOT).await?;
            return Ok(Flow::Close);
        }

        match command {
            Command::Upload { path } => self.upload(dispatcher, &path).await,
            Command::Download { path } => self.download(dispatcher, &path).await,
            Command::Exit => {
                self.stream.send_message(EXIT).await?;
                Ok(Flow::Close)
            }
            Command::Stop => self.stop(dispatcher).await,
            other => {
                let reply = dispatcher.execute(&other)?;
                self.stream.send_message(&reply).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn upload(
        &mut self,
        dispatcher: &CommandDispatcher,
        name: &str,
    ) -> Result<Flow, SessionError> {
        let destination = dispatcher.confine("upload", name, || {
            format!("Access denied: Cannot upload to '{name}' outside your designated area.")
        })?;

        let descriptor = receive_upload(
            &mut self.stream,
            self.context.ledger(),
            dispatcher.username(),
            &destination,
            name,
        )
        .await?;

        info!(
            target: AUDIT_TARGET,
            user = %dispatcher.username(),
            op = "upload",
            path = %descriptor.path.display(),
            bytes = descriptor.transferred,
        );
        self.stream
            .send_message(&format!("File '{name}' uploaded successfully."))
            .await?;
        Ok(Flow::Continue)
    }

    async fn download(
        &mut self,
        dispatcher: &CommandDispatcher,
        name: &str,
    ) -> Result<Flow, SessionError> {
        let source = dispatcher.confine("download", name, || {
            format!("Access denied: Cannot download '{name}' from outside your designated area.")
        })?;

        let descriptor = send_download(&mut self.stream, &source, name).await?;
        debug!(
            session = %self.id,
            user = %dispatcher.username(),
            path = %descriptor.path.display(),
            bytes = descriptor.transferred,
            "download complete"
        );
        Ok(Flow::Continue)
    }

    async fn stop(&mut self, dispatcher: &CommandDispatcher) -> Result<Flow, SessionError> {
        if dispatcher.username() != self.context.admin_user() {
            warn!(
                target: AUDIT_TARGET,
                user = %dispatcher.username(),
                op = "stop",
                "insufficient privileges"
            );
            self.stream.send_message(INSUFFICIENT_PRIVILEGES).await?;
            return Ok(Flow::Continue);
        }

        info!(
            target: AUDIT_TARGET,
            user = %dispatcher.username(),
            op = "stop",
            "server stop requested"
        );
        self.stream.send_message(SERVER_STOPPING).await?;
        self.coordinator.request_shutdown();
        Ok(Flow::Close)
    }

    /// Log an error and answer it. Returns whether the session continues.
    async fn report(&mut self, err: SessionError) -> bool {
        match &err {
            SessionError::Connection(e) => {
                debug!(session = %self.id, error = %e, "connection fault");
            }
            SessionError::Unhandled(e) => {
                error!(
                    session = %self.id,
                    peer = %self.peer,
                    error = ?e,
                    "unhandled session error"
                );
            }
            SessionError::TransferIncomplete {
                name,
                expected,
                received,
            } => {
                warn!(session = %self.id, file = %name, expected, received, "incomplete upload");
            }
            other => {
                debug!(session = %self.id, error = %other, "request refused");
            }
        }

        if let Some(reply) = err.reply() {
            if let Err(e) = self.stream.send_message(&reply).await {
                debug!(session = %self.id, error = %e, "failed to send error reply");
                return false;
            }
        }
        !err.is_fatal()
    }
}
