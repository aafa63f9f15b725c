//! Error types for the protocol crate.

use std::io;

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// The `Display` output of the request-level variants is exactly the line the
/// server sends back to the client, so callers can forward it verbatim.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Request errors
    /// Request did not contain any verb.
    #[error("bad request")]
    EmptyRequest,

    /// Verb is not part of the command set.
    #[error("bad request")]
    UnknownVerb(String),

    /// A known verb was sent without its required arguments.
    #[error("{0}")]
    Usage(String),

    /// Authentication-phase request did not match `<action> <user> <pass>`.
    #[error("Bad request: Format 'login <username> <password>' or 'register <username> <password>'")]
    MalformedAuth,

    /// Request bytes were not valid UTF-8.
    #[error("bad request")]
    InvalidEncoding,

    // Transfer errors
    /// The peer sent a size that is not a non-negative decimal integer.
    #[error("invalid transfer size: {0:?}")]
    InvalidSize(String),

    /// A control line did not have the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The server refused the request (the refusal line is attached).
    #[error("{0}")]
    Rejected(String),

    /// Fewer bytes than declared arrived before the stream closed.
    #[error("transfer truncated: expected {expected} bytes, received {received}")]
    Truncated {
        /// Declared size.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },

    // Frame errors
    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Buffered size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Returns true if the error means the underlying connection is unusable.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed(_) | ProtocolError::Timeout(_) | ProtocolError::Io(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
