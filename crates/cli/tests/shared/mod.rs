//! A real host on a temporary endpoint, and a runner for the `tether` binary
//! that keeps it away from any configuration on the machine running the tests

use anyhow::Result;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tether_core::endpoint::Endpoint;
use tether_core::events::EventBroadcaster;
use tether_core::Token;
use tether_host::{
    HeadlessEditor, HostContext, HostOptions, HostServer, MainThreadHandle, ShutdownHandle,
    spawn_main_thread,
};
use tokio::process::Command;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "cli-secret";

pub struct TestHost {
    pub endpoint: Endpoint,
    shutdown: ShutdownHandle,
    serving: JoinHandle<tether_core::Result<()>>,
    _dir: TempDir,
    _main: MainThreadHandle,
}

impl TestHost {
    pub async fn start(editor: HeadlessEditor) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let (dispatcher, main) = spawn_main_thread("editor", Duration::from_millis(2), || {})?;
        let context = HostContext::new(
            dispatcher,
            Arc::new(editor),
            EventBroadcaster::new(1024),
            Instant::now(),
        );

        let options = HostOptions::new(endpoint_in(&dir), Token::new(TOKEN));
        let server = HostServer::bind(options, context).await?;
        let endpoint = server.local_endpoint().clone();
        let shutdown = server.shutdown_handle();
        let serving = tokio::spawn(server.serve());

        Ok(Self {
            endpoint,
            shutdown,
            serving,
            _dir: dir,
            _main: main,
        })
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.shutdown();
        self.serving.await??;
        Ok(())
    }
}

pub struct CliOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `tether` with `args` in an empty working and home directory
pub async fn tether(args: &[&str]) -> Result<CliOutput> {
    let home = tempfile::tempdir()?;
    let output = Command::new(env!("CARGO_BIN_EXE_tether"))
        .args(args)
        .current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env("NO_COLOR", "1")
        .env_remove("TETHER_TOKEN")
        .env_remove("TETHER_ENDPOINT")
        .env_remove("RUST_LOG")
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(CliOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(unix)]
fn endpoint_in(dir: &TempDir) -> Endpoint {
    Endpoint::Unix(dir.path().join("editor.sock"))
}

#[cfg(not(unix))]
fn endpoint_in(_dir: &TempDir) -> Endpoint {
    Endpoint::Tcp("127.0.0.1:0".parse().expect("valid address"))
}
