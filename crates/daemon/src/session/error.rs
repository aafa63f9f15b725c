//! Session error taxonomy.
//!
//! Every failure inside a session ends up as a [`SessionError`]. Recoverable
//! errors are answered with a single line and the session continues; fatal
//! ones end the session only, never the server.

use std::io;

use protocol::messages::{
    BAD_REQUEST, DOWNLOAD_NOT_FOUND, INVALID_UPLOAD_SIZE, REGISTRATION_FAILED,
    REGISTRATION_INVALID_USERNAME,
};
use protocol::ProtocolError;
use thiserror::Error;

use crate::accounts::{QuotaError, RegistryError};
use crate::files::TransferError;

/// Errors that can occur while serving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed request. The session continues.
    #[error("{0}")]
    Protocol(ProtocolError),

    /// Bad credentials or refused registration.
    #[error("{0}")]
    Auth(String),

    /// A path argument resolved outside the user's root.
    #[error("{0}")]
    AccessDenied(String),

    /// Declared upload size exceeds the remaining quota.
    #[error("Insufficient quota")]
    QuotaExceeded { requested: u64, remaining: u64 },

    /// A filesystem operation or transfer precondition failed.
    #[error("{0}")]
    Operation(String),

    /// Peer stopped sending before the declared size arrived. Quota has
    /// already been reconciled.
    #[error("Error: Incomplete upload for '{name}'. Please try again.")]
    TransferIncomplete {
        name: String,
        expected: u64,
        received: u64,
    },

    /// Socket failure. Ends the session.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    /// Anything else. The client only sees a generic line; the chain is
    /// logged, since it can carry server paths.
    #[error("Server error: internal error")]
    Unhandled(#[from] anyhow::Error),
}

impl SessionError {
    /// Whether the session must end after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Connection(_) | SessionError::Unhandled(_))
    }

    /// Line to send back to the client, if the connection can still take one.
    pub fn reply(&self) -> Option<String> {
        match self {
            SessionError::Connection(_) => None,
            SessionError::Protocol(ProtocolError::MessageTooLarge { .. }) => {
                Some(BAD_REQUEST.to_string())
            }
            other => Some(other.to_string()),
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => SessionError::Connection(e),
            ProtocolError::ConnectionClosed(msg) => {
                SessionError::Connection(io::Error::new(io::ErrorKind::UnexpectedEof, msg))
            }
            ProtocolError::Timeout(msg) => {
                SessionError::Connection(io::Error::new(io::ErrorKind::TimedOut, msg))
            }
            other => SessionError::Protocol(other),
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidUsername(_) => {
                SessionError::Auth(REGISTRATION_INVALID_USERNAME.to_string())
            }
            RegistryError::AlreadyExists(_) => SessionError::Auth(REGISTRATION_FAILED.to_string()),
            other => SessionError::Unhandled(other.into()),
        }
    }
}

impl From<QuotaError> for SessionError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Insufficient {
                requested,
                remaining,
            } => SessionError::QuotaExceeded {
                requested,
                remaining,
            },
            QuotaError::Registry(e) => SessionError::Unhandled(e.into()),
        }
    }
}

impl From<TransferError> for SessionError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::IsADirectory { name } => {
                SessionError::Operation(format!("Error: '{name}' is a directory."))
            }
            TransferError::InvalidSize(_) => {
                SessionError::Operation(INVALID_UPLOAD_SIZE.to_string())
            }
            TransferError::NotAFile { .. } => {
                SessionError::Operation(DOWNLOAD_NOT_FOUND.to_string())
            }
            TransferError::Storage { name, source } => {
                SessionError::Operation(format!("Error: Could not store '{name}': {source}"))
            }
            TransferError::Quota(e) => e.into(),
            TransferError::Incomplete {
                name,
                expected,
                received,
            } => SessionError::TransferIncomplete {
                name,
                expected,
                received,
            },
            TransferError::Connection(e) => SessionError::Connection(e),
            TransferError::Aborted { source, .. } => SessionError::Connection(source),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Connection(err)
    }
}
