use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tether_client::{ClientOptions, TetherClient};
use tether_core::config::{TetherConfig, Token, generate_token};
use tether_core::endpoint::Endpoint;
use tether_core::logging::{self, LogLevel, LoggerBuilder};
use tether_core::{RetryPolicy, TetherError};
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about = "Drive a tether editor host", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host endpoint (unix:<path>, tcp:<ip:port>, ip:port or an absolute path)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Shared secret printed by the host
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Fail at once instead of retrying an unreachable or busy host
    #[arg(long)]
    no_retry: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the editor is up and ready
    Health,
    /// Asset database operations
    Assets {
        #[command(subcommand)]
        action: AssetsAction,
    },
    /// Build the player or asset bundles
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
    /// Print host events as JSON lines until interrupted
    Events {
        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Print a fresh random token
    Token,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AssetsAction {
    /// Rescan the project for changed files
    Refresh,
    /// Import one asset
    Import { path: String },
    /// Move or rename an asset
    Move { from: String, to: String },
    /// Delete an asset
    Delete { path: String },
}

#[derive(Subcommand)]
enum BuildAction {
    /// Build a player
    Player {
        /// Build target, e.g. linux64, win64, webgl
        #[arg(short, long)]
        target: String,
        /// Output location
        #[arg(short, long)]
        output: String,
        /// Development build
        #[arg(long)]
        development: bool,
    },
    /// Build asset bundles
    Bundles {
        #[arg(short, long)]
        target: String,
        #[arg(short, long)]
        output: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration, tokens redacted
    Show,
    /// Generate default configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long, default_value = "tether.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<TetherError>() {
                Some(error) => eprintln!("tether: {} [{}]", e, error.kind()),
                None => eprintln!("tether: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = TetherConfig::resolve(cli.config.as_deref())?;
    logging::apply_env(&mut config.logging)?;
    let mut logger = LoggerBuilder::from_config(config.logging.clone());
    if cli.verbose {
        logger = logger.level(LogLevel::Debug);
    }
    logger.init()?;
    debug!("Configuration loaded and validated successfully");

    if let Some(endpoint) = &cli.endpoint {
        config.client.endpoint = Endpoint::parse(endpoint)?;
    }
    if let Some(token) = &cli.token {
        config.client.token = Some(Token::new(token.clone()));
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.client.call_timeout_ms = timeout_ms;
    }
    if cli.no_retry {
        config.client.retry = RetryPolicy::none();
    }

    match cli.command {
        Commands::Token => {
            println!("{}", generate_token().expose());
            Ok(())
        }
        Commands::Config { action } => handle_config_command(action, &config),
        Commands::Health => {
            let client = connect(&config).await?;
            print_json(&client.health().await?)
        }
        Commands::Assets { action } => {
            let client = connect(&config).await?;
            let result = match action {
                AssetsAction::Refresh => client.refresh_assets().await?,
                AssetsAction::Import { path } => client.import_asset(path).await?,
                AssetsAction::Move { from, to } => client.move_asset(from, to).await?,
                AssetsAction::Delete { path } => client.delete_asset(path).await?,
            };
            print_json(&result)
        }
        Commands::Build { action } => {
            let client = connect(&config).await?;
            let report = match action {
                BuildAction::Player {
                    target,
                    output,
                    development,
                } => client.build_player(target, output, development).await?,
                BuildAction::Bundles { target, output } => {
                    client.build_bundles(target, output).await?
                }
            };
            print_json(&report)
        }
        Commands::Events { count } => {
            let client = connect(&config).await?;
            tail_events(&client, count).await
        }
    }
}

async fn connect(config: &TetherConfig) -> Result<TetherClient> {
    let options = ClientOptions::from_config(config)
        .context("no token configured; pass --token or set TETHER_TOKEN")?;
    info!("Connecting to {}", options.endpoint);
    Ok(TetherClient::connect(options).await?)
}

async fn tail_events(client: &TetherClient, count: Option<usize>) -> Result<()> {
    let mut events = client.subscribe().await?;
    let mut seen = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    seen += 1;
                    if count.is_some_and(|count| seen >= count) {
                        break;
                    }
                }
                None => {
                    info!("Host closed the session");
                    break;
                }
            },
        }
    }

    if events.dropped() > 0 {
        eprintln!("{} low-priority events were dropped", events.dropped());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(action: ConfigAction, config: &TetherConfig) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut shown = config.clone();
            let redacted = || Some(Token::new("<redacted>"));
            if shown.client.token.is_some() {
                shown.client.token = redacted();
            }
            if shown.host.token.is_some() {
                shown.host.token = redacted();
            }
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        ConfigAction::Init { output } => {
            TetherConfig::default().save_to_file(&output)?;
            println!("Default configuration saved to: {}", output.display());
        }
    }
    Ok(())
}
