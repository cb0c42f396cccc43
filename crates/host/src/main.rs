use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::config::{TetherConfig, Token, generate_token};
use tether_core::endpoint::Endpoint;
use tether_core::events::EventBroadcaster;
use tether_core::logging::{self, LogLevel, LoggerBuilder};
use tether_host::{EventLogLayer, HeadlessEditor, HostContext, HostOptions, HostServer, MainThreadPump};
use tracing::{error, info};

/// Headless editor host serving the tether IPC protocol
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint to listen on (unix:<path>, tcp:<ip:port>, ip:port or an absolute path)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Shared secret clients must present; generated and printed when absent
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project name reported to clients
    #[arg(long, default_value = "HeadlessProject")]
    project: String,

    /// Assets present when the editor starts
    #[arg(long = "asset")]
    assets: Vec<String>,

    /// Start busy (as if compiling scripts) for this many milliseconds
    #[arg(long)]
    busy_for_ms: Option<u64>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TetherConfig::resolve(args.config.as_deref())?;
    logging::apply_env(&mut config.logging)?;
    if let Some(endpoint) = &args.endpoint {
        config.host.endpoint = Endpoint::parse(endpoint)?;
    }
    if let Some(token) = &args.token {
        config.host.token = Some(Token::new(token.clone()));
    }

    let started = Instant::now();
    let events = EventBroadcaster::new(config.host.event_capacity);
    let forwarder =
        EventLogLayer::new(events.clone(), started).with_min_level(config.host.forward_log_level);
    let mut logger = LoggerBuilder::from_config(config.logging.clone()).layer(Box::new(forwarder));
    if let Some(level) = args.log_level {
        logger = logger.level(level);
    }
    logger.init()?;

    if config.host.token.as_ref().is_none_or(Token::is_empty) {
        let token = generate_token();
        // Printed on stdout so a launcher can capture it
        println!("TETHER_TOKEN={}", token.expose());
        config.host.token = Some(token);
    }
    let options = HostOptions::from_config(&config)?;

    // This thread is the editor's main thread from here on
    let (mut pump, dispatcher) = MainThreadPump::new();
    let editor = Arc::new(HeadlessEditor::new(args.project).with_assets(args.assets));
    let context = HostContext::new(dispatcher, editor.clone(), events, started);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tether-io")
        .build()
        .context("failed to start the I/O runtime")?;

    let server = runtime.block_on(HostServer::bind(options, context))?;
    info!("Listening on {}", server.local_endpoint());

    let shutdown = server.shutdown_handle();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });
    let serving = runtime.spawn(server.serve());

    let mut busy_until = args.busy_for_ms.map(|ms| {
        editor.set_busy(Some("compiling scripts".to_string()));
        info!("Editor busy for {}ms", ms);
        Instant::now() + Duration::from_millis(ms)
    });

    let tick_interval = config.host.tick_interval();
    while !serving.is_finished() {
        pump.tick();
        if busy_until.is_some_and(|until| Instant::now() >= until) {
            editor.set_busy(None);
            busy_until = None;
            info!("Editor is ready");
        }
        pump.park(tick_interval);
    }
    pump.close();

    match runtime.block_on(serving) {
        Ok(result) => result?,
        Err(e) => error!("Server task failed: {}", e),
    }
    info!("Host stopped");
    Ok(())
}
