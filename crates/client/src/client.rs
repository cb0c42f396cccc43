//! # Reconnecting client
//!
//! [`TetherClient`] hides the connection lifecycle behind a call-and-await
//! API. The first call (or an explicit [`TetherClient::connect`]) opens a
//! transport, performs the handshake and keeps the resulting
//! [`ClientSession`]. When the session dies, the next call reconnects with
//! the configured [`RetryPolicy`]: exponential backoff with jitter, capped,
//! and never retrying a rejection that needs a configuration change.
//!
//! ```text
//!   Disconnected ──call/connect──▶ Connecting ──Welcome──▶ Connected
//!        ▲                             │                      │
//!        └──── retries exhausted ──────┘◀── transport lost ───┘
//! ```
//!
//! Calls themselves are never retried: a request that may have reached the
//! host is reported to the caller rather than sent twice.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! # async fn example() -> tether_core::Result<()> {
//! use tether_client::{ClientOptions, TetherClient};
//! use tether_core::{Endpoint, Token};
//!
//! let endpoint = Endpoint::parse("unix:/tmp/tether-editor.sock")?;
//! let client = TetherClient::new(ClientOptions::new(endpoint, Token::new("s3cret")))?;
//!
//! let health = client.health().await?;
//! println!("ready: {}", health.ready);
//! client.import_asset("Assets/Textures/hero.png").await?;
//! # Ok(())
//! # }
//! ```

use crate::session::{ClientSession, SessionOptions};
use crate::transport::{EndpointTransport, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_core::config::{TetherConfig, Token};
use tether_core::endpoint::Endpoint;
use tether_core::error::retry::{RetryPolicy, retry_async};
use tether_core::error::{ConfigError, RequestError, Result};
use tether_core::events::{DEFAULT_EVENT_CAPACITY, EventSubscription};
use tether_core::protocol::{
    AssetRequest, AssetResult, BuildReport, BuildRequest, FeatureSet, FrameCodec, HealthStatus,
    Request, Response, Welcome,
};
use tracing::{debug, info};

/// Everything needed to reach and authenticate with a host
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: Endpoint,
    pub token: Token,
    /// Features requested in `Hello`
    pub features: FeatureSet,
    pub client_name: String,
    /// Bounds transport connect and the handshake, each
    pub connect_timeout: Duration,
    /// Default timeout for [`TetherClient::call`] and the typed helpers
    pub call_timeout: Duration,
    /// Backoff between reconnect attempts
    pub retry: RetryPolicy,
    pub frames: FrameCodec,
    pub event_capacity: usize,
}

impl ClientOptions {
    pub fn new(endpoint: Endpoint, token: Token) -> Self {
        Self {
            endpoint,
            token,
            features: FeatureSet::all(),
            client_name: "tether-client".to_string(),
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            frames: FrameCodec::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Client options from a resolved configuration. The token is mandatory.
    pub fn from_config(config: &TetherConfig) -> Result<Self> {
        let client = &config.client;
        let token = client
            .token
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "client.token".to_string(),
            })?;

        Ok(Self {
            endpoint: client.endpoint.clone(),
            token,
            features: client.feature_set(),
            client_name: client.client_name.clone(),
            connect_timeout: client.connect_timeout(),
            call_timeout: client.call_timeout(),
            retry: client.retry.clone(),
            frames: config.limits.frame_codec(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        })
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            token: self.token.clone(),
            features: self.features.clone(),
            client_name: self.client_name.clone(),
            handshake_timeout: self.connect_timeout,
            frames: self.frames,
            event_capacity: self.event_capacity,
        }
    }
}

/// Where the client stands with its host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Disconnected => write!(f, "disconnected"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Connected => write!(f, "connected"),
        }
    }
}

/// Reconnecting client over any [`Transport`]
pub struct TetherClient<T: Transport = EndpointTransport> {
    transport: T,
    options: ClientOptions,
    /// Serializes reconnects so concurrent callers share one attempt
    connect_lock: tokio::sync::Mutex<()>,
    connecting: AtomicBool,
    session: Mutex<Option<Arc<ClientSession>>>,
}

impl TetherClient<EndpointTransport> {
    /// A client for `options.endpoint`. Nothing is connected yet.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let transport = EndpointTransport::new(&options.endpoint, options.connect_timeout)?;
        Ok(Self::with_transport(transport, options))
    }

    /// Create a client and connect it right away
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let client = Self::new(options)?;
        client.ensure_connected().await?;
        Ok(client)
    }
}

impl<T: Transport> TetherClient<T> {
    pub fn with_transport(transport: T, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            connect_lock: tokio::sync::Mutex::new(()),
            connecting: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> ClientState {
        if self.live_session().is_some() {
            ClientState::Connected
        } else if self.connecting.load(Ordering::Acquire) {
            ClientState::Connecting
        } else {
            ClientState::Disconnected
        }
    }

    /// Connect if there is no live session, retrying per the policy
    pub async fn ensure_connected(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    /// Drop the current session. Pending calls fail with a closed transport.
    pub fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            info!("Disconnecting session {}", session.welcome().session_id);
            session.close();
        }
    }

    /// `Welcome` of the live session, if any
    pub fn welcome(&self) -> Option<Welcome> {
        self.live_session().map(|session| session.welcome().clone())
    }

    /// Features granted to the live session, if any
    pub fn features(&self) -> Option<FeatureSet> {
        self.live_session().map(|session| session.features().clone())
    }

    /// Events of the current session, connecting first if needed. The
    /// subscription ends when that session closes.
    pub async fn subscribe(&self) -> Result<EventSubscription> {
        Ok(self.session().await?.subscribe())
    }

    /// Send a request with the default call timeout
    pub async fn call(&self, request: Request) -> Result<Response> {
        self.call_with_timeout(request, self.options.call_timeout)
            .await
    }

    pub async fn call_with_timeout(&self, request: Request, timeout: Duration) -> Result<Response> {
        let session = self.session().await?;
        session.call(request, timeout).await
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        match self.call(Request::Health).await? {
            Response::Health(status) => Ok(status),
            other => Err(unexpected("health", &other)),
        }
    }

    pub async fn refresh_assets(&self) -> Result<AssetResult> {
        self.assets(AssetRequest::Refresh).await
    }

    pub async fn import_asset(&self, path: impl Into<String>) -> Result<AssetResult> {
        self.assets(AssetRequest::Import { path: path.into() })
            .await
    }

    pub async fn move_asset(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<AssetResult> {
        self.assets(AssetRequest::Move {
            from: from.into(),
            to: to.into(),
        })
        .await
    }

    pub async fn delete_asset(&self, path: impl Into<String>) -> Result<AssetResult> {
        self.assets(AssetRequest::Delete { path: path.into() })
            .await
    }

    pub async fn build_player(
        &self,
        target: impl Into<String>,
        output_path: impl Into<String>,
        development: bool,
    ) -> Result<BuildReport> {
        self.build(BuildRequest::Player {
            target: target.into(),
            output_path: output_path.into(),
            development,
        })
        .await
    }

    pub async fn build_bundles(
        &self,
        target: impl Into<String>,
        output_path: impl Into<String>,
    ) -> Result<BuildReport> {
        self.build(BuildRequest::Bundles {
            target: target.into(),
            output_path: output_path.into(),
        })
        .await
    }

    async fn assets(&self, request: AssetRequest) -> Result<AssetResult> {
        match self.call(Request::Assets(request)).await? {
            Response::Assets(result) => Ok(result),
            other => Err(unexpected("assets", &other)),
        }
    }

    async fn build(&self, request: BuildRequest) -> Result<BuildReport> {
        match self.call(Request::Build(request)).await? {
            Response::Build(report) => Ok(report),
            other => Err(unexpected("build", &other)),
        }
    }

    fn live_session(&self) -> Option<Arc<ClientSession>> {
        self.session
            .lock()
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
    }

    async fn session(&self) -> Result<Arc<ClientSession>> {
        if let Some(session) = self.live_session() {
            return Ok(session);
        }

        let _guard = self.connect_lock.lock().await;
        // Another caller may have reconnected while we waited
        if let Some(session) = self.live_session() {
            return Ok(session);
        }

        let _connecting = Connecting::enter(&self.connecting);
        let session = Arc::new(retry_async(move || self.connect_once(), &self.options.retry).await?);
        info!(
            "Connected to {} via {} (session {})",
            session.welcome().host_name,
            self.transport.name(),
            session.welcome().session_id
        );
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    async fn connect_once(&self) -> Result<ClientSession> {
        debug!("Connecting via {} transport", self.transport.name());
        let stream = self.transport.connect().await?;
        ClientSession::establish(stream, &self.options.session_options()).await
    }
}

impl<T: Transport> std::fmt::Debug for TetherClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherClient")
            .field("endpoint", &self.options.endpoint)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the connecting flag however the attempt ends
struct Connecting<'a>(&'a AtomicBool);

impl<'a> Connecting<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for Connecting<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> tether_core::error::TetherError {
    RequestError::UnexpectedResponse {
        expected,
        actual: actual.name(),
    }
    .into()
}
