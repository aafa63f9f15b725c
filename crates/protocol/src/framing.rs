//! Message framing over a byte stream.
//!
//! # Framings
//!
//! - `legacy`: one request is whatever a single bounded read returns (at
//!   most [`MAX_MESSAGE_SIZE`] bytes) and responses carry no delimiter. This
//!   matches existing clients that send one request and wait for one reply.
//! - `line`: every message in both directions ends with `\n` (`\r\n` is
//!   accepted). Segmented and coalesced reads are reassembled.
//! - `auto`: the first read decides. A newline in it selects `line`,
//!   otherwise `legacy`.
//!
//! Raw transfer bytes are read with [`MessageStream::read_chunk`], which
//! drains anything already buffered before touching the socket and never
//! returns more than requested, so the next control message stays intact.

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Largest control message accepted in one piece (1 KiB).
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Chunk size used for streaming file contents (1 KiB).
pub const TRANSFER_CHUNK_SIZE: usize = 1024;

/// How message boundaries are found on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Decide from the first read.
    #[default]
    Auto,
    /// One bounded read per message, undelimited responses.
    Legacy,
    /// Newline-terminated messages.
    Line,
}

/// A byte stream carrying control messages and raw transfer data.
pub struct MessageStream<S> {
    stream: S,
    buffer: BytesMut,
    framing: Framing,
    /// Dropping the tail of an oversized line up to its newline.
    discarding: bool,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with the given framing.
    pub fn new(stream: S, framing: Framing) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
            framing,
            discarding: false,
        }
    }

    /// Current framing. Stays `Auto` until the first message arrives.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Number of bytes read from the socket but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read the next control message.
    ///
    /// Returns `None` when the peer has closed the connection and no
    /// buffered message remains.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MessageTooLarge`] if a line exceeds the limit (the
    /// whole line, up to its newline, is discarded), [`ProtocolError::InvalidEncoding`] for
    /// non UTF-8 input, and [`ProtocolError::Io`] for socket failures.
    pub async fn read_message(&mut self) -> Result<Option<String>> {
        loop {
            match self.framing {
                Framing::Line => {
                    let newline = self.buffer.iter().position(|&b| b == b'\n');
                    if self.discarding {
                        match newline {
                            Some(pos) => {
                                let _ = self.buffer.split_to(pos + 1);
                                self.discarding = false;
                                continue;
                            }
                            None => self.buffer.clear(),
                        }
                    } else if let Some(pos) = newline {
                        let line = self.buffer.split_to(pos + 1);
                        return decode_line(&line).map(Some);
                    } else if self.buffer.len() >= MAX_MESSAGE_SIZE {
                        let size = self.buffer.len();
                        self.buffer.clear();
                        self.discarding = true;
                        return Err(ProtocolError::MessageTooLarge {
                            size,
                            max: MAX_MESSAGE_SIZE,
                        });
                    }
                }
                Framing::Legacy => {
                    if !self.buffer.is_empty() {
                        let take = self.buffer.len().min(MAX_MESSAGE_SIZE);
                        let message = self.buffer.split_to(take);
                        return decode_line(&message).map(Some);
                    }
                }
                Framing::Auto => {}
            }

            let read = self.fill(MAX_MESSAGE_SIZE.saturating_sub(self.buffer.len())).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // Peer closed after an unterminated line: deliver what is left.
                let rest = self.buffer.split();
                return decode_line(&rest).map(Some);
            }

            if self.framing == Framing::Auto {
                self.framing = if self.buffer.contains(&b'\n') {
                    Framing::Line
                } else {
                    Framing::Legacy
                };
            }
        }
    }

    /// Send a control message, adding the delimiter required by the framing.
    pub async fn send_message(&mut self, message: &str) -> io::Result<()> {
        if self.framing == Framing::Line {
            let mut line = Vec::with_capacity(message.len() + 1);
            line.extend_from_slice(message.as_bytes());
            line.push(b'\n');
            self.stream.write_all(&line).await?;
        } else {
            self.stream.write_all(message.as_bytes()).await?;
        }
        self.stream.flush().await
    }

    /// Read up to `max` raw bytes.
    ///
    /// Buffered bytes are returned first. An empty result means the peer
    /// closed the connection.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if !self.buffer.is_empty() {
            let take = self.buffer.len().min(max);
            return Ok(self.buffer.split_to(take).freeze());
        }

        let mut chunk = vec![0u8; max.min(TRANSFER_CHUNK_SIZE)];
        let read = self.stream.read(&mut chunk).await?;
        chunk.truncate(read);
        Ok(Bytes::from(chunk))
    }

    /// Write raw bytes without any framing.
    pub async fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Flush pending writes.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Perform one bounded read into the buffer.
    async fn fill(&mut self, max: usize) -> io::Result<usize> {
        let mut scratch = [0u8; MAX_MESSAGE_SIZE];
        let limit = max.clamp(1, MAX_MESSAGE_SIZE);
        let read = self.stream.read(&mut scratch[..limit]).await?;
        self.buffer.extend_from_slice(&scratch[..read]);
        Ok(read)
    }
}

/// Decode a message, stripping one trailing `\n` or `\r\n`.
fn decode_line(raw: &[u8]) -> Result<String> {
    let mut bytes = raw;
    if bytes.last() == Some(&b'\n') {
        bytes = &bytes[..bytes.len() - 1];
        if bytes.last() == Some(&b'\r') {
            bytes = &bytes[..bytes.len() - 1];
        }
    }
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidEncoding)
}
