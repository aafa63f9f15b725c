//! Programmatic client for the Lockbox protocol.
//!
//! The client always speaks the `line` framing, which a server in `auto`
//! mode detects from the first request. It is used by the integration tests
//! and by tooling that scripts a server.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{ProtocolError, Result};
use crate::framing::{Framing, MessageStream, TRANSFER_CHUNK_SIZE};
use crate::messages::{
    parse_download_ready, AuthAction, AuthRequest, AUTHENTICATED, QUOTA_OK, READY_FOR_UPLOAD_SIZE,
    REGISTERED,
};

/// Default timeout for a single exchange in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// A line-framed protocol client.
pub struct Client<S = TcpStream> {
    stream: MessageStream<S>,
    timeout: Duration,
}

impl Client<TcpStream> {
    /// Connect to a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection cannot be established.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: MessageStream::new(stream, Framing::Line),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Send one request line and return the server's reply.
    pub async fn request(&mut self, line: &str) -> Result<String> {
        self.send(line).await?;
        self.recv().await
    }

    /// Log into an existing account.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Rejected`] with the server's reply if the credentials
    /// were refused.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.authenticate(AuthAction::Login, username, password, AUTHENTICATED)
            .await
    }

    /// Register a new account. The session is authenticated on success.
    pub async fn register(&mut self, username: &str, password: &str) -> Result<()> {
        self.authenticate(AuthAction::Register, username, password, REGISTERED)
            .await
    }

    async fn authenticate(
        &mut self,
        action: AuthAction,
        username: &str,
        password: &str,
        expected: &str,
    ) -> Result<()> {
        let request = AuthRequest {
            action,
            username: username.to_string(),
            password: password.to_string(),
        };
        let reply = self.request(&request.to_line()).await?;
        if reply == expected {
            Ok(())
        } else {
            Err(ProtocolError::Rejected(reply))
        }
    }

    /// Run the upload handshake up to `QUOTA_OK` without sending any data.
    ///
    /// After this returns the server expects exactly `size` raw bytes, which
    /// can be sent with [`Client::send_data`].
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Rejected`] carrying the server's line if the upload
    /// was refused before or at the quota check.
    pub async fn begin_upload(&mut self, remote: &str, size: u64) -> Result<()> {
        let reply = self.request(&format!("upload {remote}")).await?;
        if reply != READY_FOR_UPLOAD_SIZE {
            return Err(ProtocolError::Rejected(reply));
        }

        let reply = self.request(&size.to_string()).await?;
        if reply != QUOTA_OK {
            return Err(ProtocolError::Rejected(reply));
        }
        Ok(())
    }

    /// Upload `data` to `remote` and return the server's final status line.
    pub async fn upload(&mut self, remote: &str, data: &[u8]) -> Result<String> {
        self.begin_upload(remote, data.len() as u64).await?;
        for chunk in data.chunks(TRANSFER_CHUNK_SIZE) {
            self.stream.write_data(chunk).await?;
        }
        self.stream.flush().await?;
        self.recv().await
    }

    /// Download `remote` into memory.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Rejected`] if the server refused the download and
    /// [`ProtocolError::Truncated`] if the connection closed early.
    pub async fn download(&mut self, remote: &str) -> Result<Vec<u8>> {
        let header = self.request(&format!("download {remote}")).await?;
        let expected = parse_download_ready(&header)?;

        let mut data = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
        let mut received = 0u64;
        while received < expected {
            let want = usize::try_from(expected - received)
                .unwrap_or(usize::MAX)
                .min(TRANSFER_CHUNK_SIZE);
            let chunk = tokio::time::timeout(self.timeout, self.stream.read_chunk(want))
                .await
                .map_err(|_| ProtocolError::Timeout("download".to_string()))??;
            if chunk.is_empty() {
                return Err(ProtocolError::Truncated { expected, received });
            }
            received += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Write raw transfer bytes.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_data(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a control line without waiting for a reply.
    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.stream.send_message(line).await?;
        Ok(())
    }

    /// Wait for the next reply line.
    pub async fn recv(&mut self) -> Result<String> {
        tokio::time::timeout(self.timeout, self.stream.read_message())
            .await
            .map_err(|_| ProtocolError::Timeout("waiting for reply".to_string()))??
            .ok_or_else(|| ProtocolError::ConnectionClosed("server closed connection".to_string()))
    }

    /// Close the write side, signalling end of stream to the server.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
