//! Transport abstraction for the tether client
//!
//! A transport knows how to open one bidirectional byte stream to the host.
//! Everything above it (framing, handshake, correlation) is stream-agnostic.

use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tether_core::endpoint::Endpoint;
use tether_core::error::{Result, TransportError};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub mod tcp;
#[cfg(unix)]
pub mod unix;

pub use tcp::{TcpTransport, TcpTransportConfig};
#[cfg(unix)]
pub use unix::{UnixTransport, UnixTransportConfig};

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// The stream type that implements AsyncRead + AsyncWrite
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a fresh connection to the host
    async fn connect(&self) -> Result<Self::Stream>;

    /// Get the name of this transport type
    fn name(&self) -> &'static str;
}

/// Transport chosen from an [`Endpoint`]
#[derive(Debug, Clone)]
pub enum EndpointTransport {
    #[cfg(unix)]
    Unix(UnixTransport),
    Tcp(TcpTransport),
}

impl EndpointTransport {
    pub fn new(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(EndpointTransport::Unix(UnixTransport::new(
                UnixTransportConfig {
                    socket_path: path.clone(),
                    connection_timeout: connect_timeout,
                },
            ))),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "unix sockets are not available on this platform".to_string(),
            }
            .into()),
            Endpoint::Tcp(addr) => Ok(EndpointTransport::Tcp(TcpTransport::new(
                TcpTransportConfig {
                    address: *addr,
                    connection_timeout: connect_timeout,
                    nodelay: true,
                },
            ))),
        }
    }
}

#[async_trait]
impl Transport for EndpointTransport {
    type Stream = EndpointStream;

    async fn connect(&self) -> Result<Self::Stream> {
        match self {
            #[cfg(unix)]
            EndpointTransport::Unix(transport) => transport.connect().await.map(EndpointStream::Unix),
            EndpointTransport::Tcp(transport) => transport.connect().await.map(EndpointStream::Tcp),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            #[cfg(unix)]
            EndpointTransport::Unix(transport) => transport.name(),
            EndpointTransport::Tcp(transport) => transport.name(),
        }
    }
}

/// A connected stream of either kind
pub enum EndpointStream {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

impl AsyncRead for EndpointStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            EndpointStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EndpointStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            EndpointStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            EndpointStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            EndpointStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub(crate) fn connect_failed(endpoint: impl ToString, reason: impl ToString) -> TransportError {
    TransportError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_selects_transport() {
        let tcp = EndpointTransport::new(
            &Endpoint::parse("tcp:127.0.0.1:7420").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(tcp.name(), "tcp");

        #[cfg(unix)]
        {
            let unix = EndpointTransport::new(
                &Endpoint::parse("unix:/tmp/editor.sock").unwrap(),
                Duration::from_secs(1),
            )
            .unwrap();
            assert_eq!(unix.name(), "unix");
        }
    }
}
