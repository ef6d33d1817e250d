//! Client socket transport: TCP with optional SOCKS5 tunneling and TLS.
//!
//! `Connector` captures the target plus tunnel/TLS options; `connect()`
//! yields a [`TransportStream`] that can be split into reader and writer
//! halves for protocol layers that pump both directions concurrently.
//!
//! Broken-pipe writes surface as `WriteFailed` errors, never as a signal:
//! the Rust runtime masks `SIGPIPE` before `main`.

mod socks;
mod tls;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

pub use self::socks::socks_reply_message;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to {host}:{port}")]
    ConnectFailed { host: String, port: u16 },
    #[error("read failed: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("SOCKS handshake failed: {}", socks_reply_message(*code))]
    SocksFailed { code: u8 },
    #[error("SOCKS handshake failed: {0}")]
    SocksProtocol(String),
    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),
}

/// Object-safe alias for whatever stream the connection ended up as.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// A connect recipe: target host/port plus optional SOCKS proxy and TLS.
#[derive(Debug, Clone)]
pub struct Connector {
    host: String,
    port: u16,
    socks: Option<(String, u16)>,
    tls: Option<TlsOptions>,
}

#[derive(Debug, Clone)]
struct TlsOptions {
    accept_self_signed: bool,
}

impl Connector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, socks: None, tls: None }
    }

    /// Route the connection through an unauthenticated SOCKS5 proxy. An empty
    /// host disables a previously configured proxy.
    pub fn use_socks(&mut self, host: impl Into<String>, port: u16) {
        let host = host.into();
        self.socks = if host.is_empty() { None } else { Some((host, port)) };
    }

    /// Upgrade to TLS after the (optionally tunneled) TCP connect. With
    /// `accept_self_signed`, only the self-signed verification failure is
    /// tolerated; every other failure still aborts.
    pub fn use_tls(&mut self, accept_self_signed: bool) {
        self.tls = Some(TlsOptions { accept_self_signed });
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Establish the connection: resolve, try each address in order, then
    /// run the SOCKS and TLS layers that are configured.
    pub async fn connect(&self) -> Result<TransportStream, TransportError> {
        // with a proxy, the TCP connection goes to the proxy instead
        let (dial_host, dial_port) = match &self.socks {
            Some((host, port)) => (host.as_str(), *port),
            None => (self.host.as_str(), self.port),
        };

        let addrs = tokio::net::lookup_host((dial_host, dial_port))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                host: dial_host.to_owned(),
                port: dial_port,
            })?;

        let mut stream = None;
        for addr in addrs {
            tracing::info!(%addr, host = dial_host, "connecting");
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(error) => {
                    tracing::warn!(%addr, %error, "connection failed");
                }
            }
        }
        let mut stream = stream.ok_or_else(|| TransportError::ConnectFailed {
            host: dial_host.to_owned(),
            port: dial_port,
        })?;

        if self.socks.is_some() {
            socks::tunnel(&mut stream, &self.host, self.port).await?;
            tracing::debug!(host = %self.host, "SOCKS connection established");
        }

        let io: Box<dyn Io> = match &self.tls {
            Some(options) => {
                let tls = tls::upgrade(stream, &self.host, options.accept_self_signed).await?;
                tracing::debug!(host = %self.host, "TLS connection established");
                Box::new(tls)
            }
            None => Box::new(stream),
        };
        Ok(TransportStream { io })
    }
}

/// An established connection.
pub struct TransportStream {
    io: Box<dyn Io>,
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream").finish_non_exhaustive()
    }
}

impl TransportStream {
    /// Read some bytes. `Ok(0)` means the peer closed the connection.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.io.read(buf).await.map_err(TransportError::ReadFailed)
    }

    /// Deliver the whole buffer or fail.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(buf).await.map_err(TransportError::WriteFailed)
    }

    /// Split into independently owned reader and writer halves.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        let (rd, wr) = tokio::io::split(self.io);
        (TransportReader { inner: rd }, TransportWriter { inner: wr })
    }
}

pub struct TransportReader {
    inner: ReadHalf<Box<dyn Io>>,
}

impl TransportReader {
    /// Read with an optional timeout; `None` waits forever. `Ok(None)`
    /// reports that the timeout elapsed without data. Data already buffered
    /// by the TLS layer is returned like any other read.
    pub async fn read_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>, TransportError> {
        match timeout {
            None => self
                .inner
                .read(buf)
                .await
                .map(Some)
                .map_err(TransportError::ReadFailed),
            Some(limit) => match tokio::time::timeout(limit, self.inner.read(buf)).await {
                Err(_elapsed) => Ok(None),
                Ok(result) => result.map(Some).map_err(TransportError::ReadFailed),
            },
        }
    }
}

pub struct TransportWriter {
    inner: WriteHalf<Box<dyn Io>>,
}

impl TransportWriter {
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(buf).await.map_err(TransportError::WriteFailed)
    }

    /// Best-effort close of the write direction.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
