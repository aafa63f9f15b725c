//! Bulk transfer over a message stream.
//!
//! This module implements both directions of the transfer exchange:
//! - Upload: size negotiation, quota reservation, chunked receive into a
//!   hidden temp file next to the destination, then fsync and atomic rename
//! - Download: `DOWNLOAD_READY <size>` followed by exactly `size` raw bytes
//!
//! A short upload gives back exactly the undelivered quota and leaves no
//! partial file behind.

use std::io;
use std::path::{Path, PathBuf};

use protocol::messages::{download_ready, parse_upload_size, QUOTA_OK, READY_FOR_UPLOAD_SIZE};
use protocol::{MessageStream, TRANSFER_CHUNK_SIZE};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::accounts::{QuotaError, QuotaLedger};

/// Errors that can occur during a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Upload target is an existing directory.
    #[error("upload target is a directory: {name}")]
    IsADirectory { name: String },

    /// Client sent something other than a non-negative integer size.
    #[error("invalid upload size: {0:?}")]
    InvalidSize(String),

    /// Download source is missing or not a regular file.
    #[error("not a regular file: {name}")]
    NotAFile { name: String },

    /// Local filesystem failure before or after the byte stream.
    #[error("failed to store {name}: {source}")]
    Storage {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Quota reservation failed.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Peer closed before the declared size arrived.
    #[error("incomplete transfer of {name}: expected {expected} bytes, received {received}")]
    Incomplete {
        name: String,
        expected: u64,
        received: u64,
    },

    /// Socket failure. The session cannot continue.
    #[error("connection error during transfer: {0}")]
    Connection(#[source] io::Error),

    /// A download could not deliver the size it announced.
    #[error("download of {name} aborted: {source}")]
    Aborted {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// State of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub direction: Direction,
    /// Size announced before the byte stream.
    pub declared: u64,
    /// Bytes moved so far.
    pub transferred: u64,
    /// Destination (upload) or source (download) on disk.
    pub path: PathBuf,
}

impl TransferDescriptor {
    fn new(direction: Direction, declared: u64, path: &Path) -> Self {
        Self {
            direction,
            declared,
            transferred: 0,
            path: path.to_path_buf(),
        }
    }

    /// Whether every declared byte was moved.
    pub fn is_complete(&self) -> bool {
        self.transferred == self.declared
    }

    /// Bytes still missing.
    pub fn undelivered(&self) -> u64 {
        self.declared.saturating_sub(self.transferred)
    }
}

/// Hidden temp file next to `destination`.
fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()))
}

/// Whether `name` is the temp file of an upload still in flight.
pub fn is_upload_temp(name: &str) -> bool {
    name.strip_prefix('.')
        .and_then(|n| n.strip_suffix(".part"))
        .and_then(|n| n.rsplit_once('.'))
        .is_some_and(|(_, id)| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}

async fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to cleanup temp file");
        }
    }
}

/// Run the server side of an upload.
///
/// `destination` must already be confined to the user's root; `name` is the
/// client's spelling used in replies. The caller sends the final status line.
///
/// # Errors
///
/// Every error is returned after quota and temp file have been reconciled.
/// [`TransferError::Connection`] means the session must end.
pub async fn receive_upload<S>(
    stream: &mut MessageStream<S>,
    ledger: &QuotaLedger,
    username: &str,
    destination: &Path,
    name: &str,
) -> Result<TransferDescriptor, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if destination.is_dir() {
        return Err(TransferError::IsADirectory {
            name: name.to_string(),
        });
    }

    stream
        .send_message(READY_FOR_UPLOAD_SIZE)
        .await
        .map_err(TransferError::Connection)?;

    let size_line = match stream.read_message().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            return Err(TransferError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before sending upload size",
            )))
        }
        Err(e) if e.is_connection_fault() => {
            return Err(TransferError::Connection(io::Error::other(e)));
        }
        Err(e) => return Err(TransferError::InvalidSize(e.to_string())),
    };
    let size = parse_upload_size(&size_line)
        .map_err(|_| TransferError::InvalidSize(size_line.trim().to_string()))?;

    let temp_path = temp_path_for(destination);
    let mut file = File::create(&temp_path)
        .await
        .map_err(|source| TransferError::Storage {
            name: name.to_string(),
            source,
        })?;

    let reservation = match ledger.reserve(username, size) {
        Ok(reservation) => reservation,
        Err(e) => {
            drop(file);
            remove_temp(&temp_path).await;
            return Err(e.into());
        }
    };

    let mut descriptor = TransferDescriptor::new(Direction::Upload, size, destination);

    if let Err(e) = stream.send_message(QUOTA_OK).await {
        drop(file);
        remove_temp(&temp_path).await;
        ledger.revert(reservation, size)?;
        return Err(TransferError::Connection(e));
    }

    let mut socket_error = None;
    let mut write_error = None;
    while descriptor.transferred < size {
        let want = usize::try_from(size - descriptor.transferred)
            .unwrap_or(usize::MAX)
            .min(TRANSFER_CHUNK_SIZE);
        let chunk = match stream.read_chunk(want).await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => chunk,
            Err(e) => {
                socket_error = Some(e);
                break;
            }
        };
        descriptor.transferred += chunk.len() as u64;

        // Keep draining after a write failure so the rest of the payload is
        // not read as commands.
        if write_error.is_none() {
            if let Err(e) = file.write_all(&chunk).await {
                write_error = Some(e);
            }
        }
    }

    let stored = match write_error {
        Some(e) => Err(e),
        None if descriptor.is_complete() => finalize(file, &temp_path, destination).await,
        None => Ok(()),
    };

    if let Err(source) = stored {
        // Nothing was kept, so the whole reservation goes back.
        remove_temp(&temp_path).await;
        ledger.revert(reservation, size)?;
        if let Some(e) = socket_error {
            return Err(TransferError::Connection(e));
        }
        return Err(TransferError::Storage {
            name: name.to_string(),
            source,
        });
    }

    if !descriptor.is_complete() {
        remove_temp(&temp_path).await;
        ledger.revert(reservation, descriptor.undelivered())?;
        if let Some(e) = socket_error {
            return Err(TransferError::Connection(e));
        }
        return Err(TransferError::Incomplete {
            name: name.to_string(),
            expected: size,
            received: descriptor.transferred,
        });
    }

    ledger.commit(reservation);
    debug!(path = ?destination, size, "upload stored");
    Ok(descriptor)
}

/// Flush the temp file to disk and move it over the destination.
async fn finalize(mut file: File, temp_path: &Path, destination: &Path) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, destination).await
}

/// Run the server side of a download.
///
/// `source` must already be confined to the user's root.
///
/// # Errors
///
/// [`TransferError::NotAFile`] and [`TransferError::Storage`] are returned
/// before anything is sent. After the header, failures are
/// [`TransferError::Connection`] or [`TransferError::Aborted`], and the
/// session must end so the receiver sees the truncation.
pub async fn send_download<S>(
    stream: &mut MessageStream<S>,
    source: &Path,
    name: &str,
) -> Result<TransferDescriptor, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let metadata = match fs::metadata(source).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => {
            return Err(TransferError::NotAFile {
                name: name.to_string(),
            })
        }
    };
    let file = File::open(source)
        .await
        .map_err(|e| TransferError::Storage {
            name: name.to_string(),
            source: e,
        })?;

    let size = metadata.len();
    let mut descriptor = TransferDescriptor::new(Direction::Download, size, source);

    stream
        .send_message(&download_ready(size))
        .await
        .map_err(TransferError::Connection)?;

    // Never send more than announced, even if the file grows meanwhile.
    let mut reader = file.take(size);
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| TransferError::Aborted {
            name: name.to_string(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        stream
            .write_data(&buf[..n])
            .await
            .map_err(TransferError::Connection)?;
        descriptor.transferred += n as u64;
    }
    stream.flush().await.map_err(TransferError::Connection)?;

    if !descriptor.is_complete() {
        return Err(TransferError::Aborted {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank during download"),
        });
    }

    debug!(path = ?source, size, "download sent");
    Ok(descriptor)
}
