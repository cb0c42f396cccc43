//! Listener and accept loop

use crate::connection::{ConnectionServices, serve_connection, stopped};
use crate::handlers::HostContext;
use crate::handshake::HostHandshake;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tether_core::config::{TetherConfig, Token};
use tether_core::endpoint::Endpoint;
use tether_core::error::{ConfigError, Result, TetherError, TransportError};
use tether_core::handshake::HandshakePolicy;
use tether_core::protocol::{FeatureSet, FrameCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// How long shutdown waits for connections before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to bind a host
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub endpoint: Endpoint,
    pub token: Token,
    pub features: FeatureSet,
    pub host_name: String,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    pub frames: FrameCodec,
}

impl HostOptions {
    pub fn new(endpoint: Endpoint, token: Token) -> Self {
        Self {
            endpoint,
            token,
            features: FeatureSet::all(),
            host_name: "tether-host".to_string(),
            max_connections: 16,
            handshake_timeout: Duration::from_secs(5),
            frames: FrameCodec::default(),
        }
    }

    /// Host options from a resolved configuration. The token is mandatory.
    pub fn from_config(config: &TetherConfig) -> Result<Self> {
        let token = config
            .host
            .token
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "host.token".to_string(),
            })?;

        Ok(Self {
            endpoint: config.host.endpoint.clone(),
            token,
            features: config.host.feature_set(),
            host_name: config.host.host_name.clone(),
            max_connections: config.host.max_connections,
            handshake_timeout: config.host.handshake_timeout(),
            frames: config.limits.frame_codec(),
        })
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Stops a running [`HostServer`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

enum Listener {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    Tcp(TcpListener),
}

enum Incoming {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream, std::net::SocketAddr),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Incoming> {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Incoming::Unix(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok(Incoming::Tcp(stream, addr))
            }
        }
    }

    /// Stop listening; a Unix socket file is removed
    fn close(self) {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                drop(listener);
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!("Could not remove {}: {}", path.display(), e);
                }
            }
            Listener::Tcp(listener) => drop(listener),
        }
    }
}

/// A bound host, ready to serve
pub struct HostServer {
    listener: Listener,
    endpoint: Endpoint,
    services: ConnectionServices,
    shutdown: Arc<watch::Sender<bool>>,
}

impl HostServer {
    pub async fn bind(options: HostOptions, context: HostContext) -> Result<Self> {
        if options.token.is_empty() {
            return Err(TetherError::config("host.token", "must not be empty"));
        }
        if !options.endpoint.is_loopback() {
            return Err(TransportError::BindFailed {
                endpoint: options.endpoint.to_string(),
                reason: "only loopback addresses are served".to_string(),
            }
            .into());
        }

        let (listener, endpoint) = match &options.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let listener = bind_unix(path).await?;
                (
                    Listener::Unix {
                        listener,
                        path: path.clone(),
                    },
                    options.endpoint.clone(),
                )
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(TransportError::BindFailed {
                    endpoint: options.endpoint.to_string(),
                    reason: "unix sockets are not available on this platform".to_string(),
                }
                .into());
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| bind_failed(&options.endpoint, e))?;
                let local = listener
                    .local_addr()
                    .map_err(|e| bind_failed(&options.endpoint, e))?;
                (Listener::Tcp(listener), Endpoint::Tcp(local))
            }
        };

        let policy = HandshakePolicy::new(options.token.expose(), options.features);
        let services = ConnectionServices {
            context,
            handshake: Arc::new(HostHandshake::new(policy, options.host_name)),
            registry: ConnectionRegistry::new(options.max_connections),
            frames: options.frames,
            handshake_timeout: options.handshake_timeout,
        };

        info!("Host bound to {}", endpoint);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            endpoint,
            services,
            shutdown: Arc::new(shutdown),
        })
    }

    /// The bound endpoint, with the real port when binding to port 0
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.services.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Accept connections until shut down, then wait for them to close
    pub async fn serve(self) -> Result<()> {
        let HostServer {
            listener,
            endpoint,
            services,
            shutdown,
        } = self;
        let mut stop = shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            warn!("Connection task panicked: {}", e);
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok(incoming) => {
                        let services = services.clone();
                        let stop = shutdown.subscribe();
                        match incoming {
                            #[cfg(unix)]
                            Incoming::Unix(stream) => {
                                connections.spawn(serve_connection(stream, "unix".to_string(), services, stop));
                            }
                            Incoming::Tcp(stream, addr) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    debug!("set_nodelay failed for {}: {}", addr, e);
                                }
                                connections.spawn(serve_connection(stream, addr.to_string(), services, stop));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Accept on {} failed: {}", endpoint, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("Shutting down {}", endpoint);
        listener.close();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connection(s) after grace period", connections.len());
            connections.abort_all();
        }
        Ok(())
    }
}

fn bind_failed(endpoint: &Endpoint, e: std::io::Error) -> TetherError {
    TransportError::BindFailed {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
    .into()
}

/// Bind a socket path, clearing a stale socket left by a crashed host
#[cfg(unix)]
async fn bind_unix(path: &Path) -> Result<UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    let endpoint = Endpoint::Unix(path.to_path_buf());
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(TransportError::BindFailed {
                endpoint: endpoint.to_string(),
                reason: "another host is already listening".to_string(),
            }
            .into());
        }
        debug!("Removing stale socket {}", path.display());
        tokio::fs::remove_file(path).await?;
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(path).map_err(|e| bind_failed(&endpoint, e))?;
    // Owner-only access
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::HeadlessEditor;
    use crate::handlers::test_support::fixture;

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_socket_is_replaced_and_removed_on_shutdown() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("editor.sock");
        // A leftover socket nobody listens on
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let options = HostOptions::new(Endpoint::Unix(path.clone()), Token::new("s3cret"));
        let server = HostServer::bind(options.clone(), fx.context.clone())
            .await
            .unwrap();

        // A second host must not steal a live socket
        assert!(HostServer::bind(options, fx.context.clone()).await.is_err());

        let handle = server.shutdown_handle();
        let serving = tokio::spawn(server.serve());
        handle.shutdown();
        serving.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcp_port_zero_reports_real_port() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let options = HostOptions::new(
            Endpoint::Tcp("127.0.0.1:0".parse().unwrap()),
            Token::new("s3cret"),
        );
        let server = HostServer::bind(options, fx.context.clone()).await.unwrap();
        match server.local_endpoint() {
            Endpoint::Tcp(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected endpoint {}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refuses_empty_token_and_remote_addresses() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let empty = HostOptions::new(
            Endpoint::Tcp("127.0.0.1:0".parse().unwrap()),
            Token::new(""),
        );
        assert!(HostServer::bind(empty, fx.context.clone()).await.is_err());

        let remote = HostOptions::new(
            Endpoint::Tcp("0.0.0.0:0".parse().unwrap()),
            Token::new("s3cret"),
        );
        assert!(HostServer::bind(remote, fx.context.clone()).await.is_err());
    }
}
