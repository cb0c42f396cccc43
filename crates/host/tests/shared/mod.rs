//! A real host on a temporary endpoint, with its editor pumped by a
//! dedicated "editor" thread

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tether_client::{ClientOptions, TetherClient};
use tether_core::endpoint::Endpoint;
use tether_core::events::EventBroadcaster;
use tether_core::{RetryPolicy, Token};
use tether_host::{
    ConnectionRegistry, Dispatcher, HeadlessEditor, HostContext, HostOptions, HostServer,
    MainThreadHandle, ShutdownHandle, spawn_main_thread,
};
use tokio::task::JoinHandle;

pub const TOKEN: &str = "integration-secret";

pub struct TestHost {
    pub editor: Arc<HeadlessEditor>,
    pub endpoint: Endpoint,
    pub registry: ConnectionRegistry,
    pub events: EventBroadcaster,
    dispatcher: Dispatcher,
    shutdown: ShutdownHandle,
    serving: JoinHandle<tether_core::Result<()>>,
    _dir: TempDir,
    _main: MainThreadHandle,
}

impl TestHost {
    pub async fn start(editor: HeadlessEditor) -> Result<Self> {
        Self::start_with(editor, |options| options).await
    }

    pub async fn start_with<F>(editor: HeadlessEditor, configure: F) -> Result<Self>
    where
        F: FnOnce(HostOptions) -> HostOptions,
    {
        let dir = tempfile::tempdir()?;
        let (dispatcher, main) = spawn_main_thread("editor", Duration::from_millis(2), || {})?;
        let editor = Arc::new(editor);
        let events = EventBroadcaster::new(1024);
        let context = HostContext::new(
            dispatcher.clone(),
            editor.clone(),
            events.clone(),
            Instant::now(),
        );

        let options = configure(HostOptions::new(endpoint_in(&dir), Token::new(TOKEN)));
        let server = HostServer::bind(options, context).await?;
        let endpoint = server.local_endpoint().clone();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let serving = tokio::spawn(server.serve());

        Ok(Self {
            editor,
            endpoint,
            registry,
            events,
            dispatcher,
            shutdown,
            serving,
            _dir: dir,
            _main: main,
        })
    }

    /// Client options pointing at this host, with a fast backoff
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::new(self.endpoint.clone(), Token::new(TOKEN))
            .with_connect_timeout(Duration::from_secs(2))
            .with_call_timeout(Duration::from_secs(10))
            .with_retry(RetryPolicy::none())
    }

    pub async fn client(&self) -> Result<TetherClient> {
        Ok(TetherClient::connect(self.client_options()).await?)
    }

    /// Toggle the editor's busy state from its main thread
    pub async fn set_busy(&self, reason: Option<&str>) -> Result<()> {
        let editor = self.editor.clone();
        let reason = reason.map(str::to_string);
        self.dispatcher
            .run_on_main(move || editor.set_busy(reason))
            .await?;
        Ok(())
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.shutdown();
        self.serving.await??;
        Ok(())
    }
}

#[cfg(unix)]
fn endpoint_in(dir: &TempDir) -> Endpoint {
    Endpoint::Unix(dir.path().join("editor.sock"))
}

#[cfg(not(unix))]
fn endpoint_in(_dir: &TempDir) -> Endpoint {
    Endpoint::Tcp("127.0.0.1:0".parse().expect("valid address"))
}
