//! # Lockbox Protocol Library
//!
//! Wire vocabulary shared by the Lockbox server and its clients.
//!
//! ## Overview
//!
//! Lockbox is a plain-text, request/response protocol over TCP:
//!
//! - **Authentication phase**: `login <user> <pass>` or
//!   `register <user> <pass>`.
//! - **Command phase**: `pwd`, `ls`, `mkdir`, `rmdir`, `rmfile`, `rename`,
//!   `copy`, `upload`, `download`, `exit`, `stop`.
//! - **Bulk transfer**: a short control handshake followed by raw bytes
//!   streamed in chunks of at most 1 KiB.
//!
//! ```text
//! client                                server
//!   | upload notes.txt                     |
//!   |------------------------------------->|
//!   |                READY_FOR_UPLOAD_SIZE |
//!   |<-------------------------------------|
//!   | 5000                                 |
//!   |------------------------------------->|
//!   |                             QUOTA_OK |
//!   |<-------------------------------------|
//!   | <5000 raw bytes>                     |
//!   |------------------------------------->|
//!   |  File 'notes.txt' uploaded success.. |
//!   |<-------------------------------------|
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{AuthRequest, Command};
//!
//! let auth = AuthRequest::parse("login alice secret").unwrap();
//! assert_eq!(auth.username, "alice");
//!
//! let cmd: Command = "RENAME a.txt b.txt".parse().unwrap();
//! assert_eq!(cmd.verb(), "rename");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request grammar, response strings and transfer tokens
//! - [`framing`]: Legacy/line message framing over a byte stream
//! - [`client`]: Line-framed programmatic client
//! - [`error`]: Error types

pub mod client;
pub mod error;
pub mod framing;
pub mod messages;

pub use client::Client;
pub use error::{ProtocolError, Result};
pub use framing::{Framing, MessageStream, MAX_MESSAGE_SIZE, TRANSFER_CHUNK_SIZE};
pub use messages::{AuthAction, AuthRequest, Command};
