//! User file area.
//!
//! This module provides confined filesystem access for authenticated users:
//! - Path resolution that never leaves the user's root
//! - Directory and file commands (`ls`, `mkdir`, `copy`, ...)
//! - Chunked uploads and downloads with quota reservation
//!
//! # Security
//!
//! Every client path goes through [`PathGuard`] before the filesystem is
//! touched. Symlinks are followed during resolution, so a link pointing
//! outside the root is rejected like any other escape.

pub mod dispatcher;
pub mod guard;
pub mod transfer;

pub use dispatcher::CommandDispatcher;
pub use guard::{GuardError, PathGuard};
pub use transfer::{
    is_upload_temp, receive_upload, send_download, Direction, TransferDescriptor, TransferError,
};
