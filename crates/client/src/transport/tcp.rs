//! Loopback TCP transport
//!
//! The fallback when Unix sockets are unavailable, and handy for debugging
//! with ordinary network tools.

use super::{Transport, connect_failed};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::error::{Result, TetherError};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub address: SocketAddr,
    pub connection_timeout: Duration,
    pub nodelay: bool,
}

/// TCP transport implementation
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    pub fn address(&self) -> SocketAddr {
        self.config.address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let address = self.config.address;
        debug!("Connecting to TCP host at {}", address);

        let stream = match timeout(self.config.connection_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_failed(address, e).into()),
            Err(_) => {
                return Err(TetherError::timeout(
                    "connect",
                    self.config.connection_timeout,
                ));
            }
        };

        // Small request frames; latency matters more than throughput
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        debug!("TCP connection established to {}", address);
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
