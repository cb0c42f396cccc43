//! Unix domain socket transport
//!
//! Connects to a host listening on a socket path.

use super::{Transport, connect_failed};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::error::{Result, TetherError};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

/// Unix socket transport configuration
#[derive(Debug, Clone)]
pub struct UnixTransportConfig {
    pub socket_path: PathBuf,
    pub connection_timeout: Duration,
}

/// Unix socket transport implementation
#[derive(Debug, Clone)]
pub struct UnixTransport {
    config: UnixTransportConfig,
}

impl UnixTransport {
    pub fn new(config: UnixTransportConfig) -> Self {
        Self { config }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.config.socket_path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    type Stream = UnixStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let path = &self.config.socket_path;
        debug!("Connecting to Unix socket at {:?}", path);

        match timeout(self.config.connection_timeout, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => {
                debug!("Unix socket connection established");
                Ok(stream)
            }
            Ok(Err(e)) => Err(connect_failed(path.display(), e).into()),
            Err(_) => Err(TetherError::timeout(
                "connect",
                self.config.connection_timeout,
            )),
        }
    }

    fn name(&self) -> &'static str {
        "unix"
    }
}
