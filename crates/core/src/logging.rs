//! Unified logging infrastructure for tether
//!
//! Both the host and the command-line tools log through `tracing`. This
//! module owns the subscriber setup so that every binary gets the same
//! filter semantics (`RUST_LOG` wins over configuration) and output formats.

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

/// Subscriber stack that extra layers are attached to
pub type FilteredRegistry = Layered<EnvFilter, Registry>;

/// An additional layer installed next to the formatter
pub type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level for tether crates
    pub level: LogLevel,
    /// Per-module log levels
    pub module_levels: BTreeMap<String, LogLevel>,
    /// Log output format
    pub format: LogFormat,
    /// Output destination
    pub output: LogOutput,
    /// Include source location (file:line) in logs
    pub include_location: bool,
    /// Include thread information
    pub include_thread_info: bool,
    /// Enable ANSI color codes
    pub enable_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            module_levels: BTreeMap::new(),
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            include_location: false,
            include_thread_info: true,
            enable_colors: true,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        if *level == Level::TRACE {
            LogLevel::Trace
        } else if *level == Level::DEBUG {
            LogLevel::Debug
        } else if *level == Level::INFO {
            LogLevel::Info
        } else if *level == Level::WARN {
            LogLevel::Warn
        } else {
            LogLevel::Error
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(TetherError::config("logging.level", "unknown log level")),
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line format
    Compact,
    /// Pretty multi-line format for development
    Pretty,
    /// JSON format for structured logging
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(TetherError::config("logging.format", "unknown log format")),
        }
    }
}

/// Log output destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output
    Stdout,
    /// Standard error. The default, so stdout stays free for command output.
    Stderr,
    /// Append to a file
    File { path: PathBuf },
}

/// Logger builder for configuring the logging system
pub struct LoggerBuilder {
    config: LoggingConfig,
    extra: Vec<BoxedLayer>,
}

impl LoggerBuilder {
    /// Create a new logger builder with default configuration
    pub fn new() -> Self {
        Self::from_config(LoggingConfig::default())
    }

    /// Create a logger builder from configuration
    pub fn from_config(config: LoggingConfig) -> Self {
        Self {
            config,
            extra: Vec::new(),
        }
    }

    /// Set the global log level
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    /// Set log level for a specific module
    pub fn module_level<S: Into<String>>(mut self, module: S, level: LogLevel) -> Self {
        self.config.module_levels.insert(module.into(), level);
        self
    }

    /// Set the log format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Set the log output destination
    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    /// Enable or disable colored output
    pub fn colors(mut self, enable: bool) -> Self {
        self.config.enable_colors = enable;
        self
    }

    /// Install an extra layer next to the formatter (event forwarding, etc.)
    pub fn layer(mut self, layer: BoxedLayer) -> Self {
        self.extra.push(layer);
        self
    }

    /// Initialize the global logger
    pub fn init(self) -> Result<()> {
        install(self.config, self.extra)
    }
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize the logging system with the given configuration
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    install(config, Vec::new())
}

/// Build the filter for `config`. `RUST_LOG`, when set, replaces it entirely.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(env_filter)
            .map_err(|e| TetherError::config("RUST_LOG".to_string(), e.to_string()));
    }

    let mut directives = vec![format!("warn,tether={}", config.level)];
    for crate_name in ["tether_core", "tether_host", "tether_client", "tether_cli"] {
        directives.push(format!("{}={}", crate_name, config.level));
    }
    for (module, level) in &config.module_levels {
        directives.push(format!("{}={}", module, level));
    }

    EnvFilter::try_new(directives.join(","))
        .map_err(|e| TetherError::config("logging.module_levels".to_string(), e.to_string()))
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File { path } => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
    })
}

fn install(config: LoggingConfig, extra: Vec<BoxedLayer>) -> Result<()> {
    let filter = build_filter(&config)?;
    let writer = make_writer(&config.output)?;
    let ansi = config.enable_colors && !matches!(config.output, LogOutput::File { .. });

    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(config.include_thread_info)
        .with_thread_names(config.include_thread_info)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let fmt_layer: BoxedLayer = match config.format {
        LogFormat::Compact => base.with_ansi(ansi).compact().boxed(),
        LogFormat::Pretty => base.with_ansi(ansi).pretty().boxed(),
        LogFormat::Json => base.json().with_current_span(true).boxed(),
    };

    let mut layers = extra;
    layers.push(fmt_layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| TetherError::internal(format!("logging already initialized: {}", e)))?;

    tracing::debug!("Logging initialized at level {}", config.level);
    Ok(())
}

/// Initialize logging with environment-based configuration
pub fn init_from_env() -> Result<()> {
    let mut config = LoggingConfig::default();
    apply_env(&mut config)?;
    init_logging(config)
}

/// Apply `TETHER_LOG_LEVEL`, `TETHER_LOG_FORMAT`, `TETHER_LOG_FILE` and `NO_COLOR`
pub fn apply_env(config: &mut LoggingConfig) -> Result<()> {
    if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
        config.level = level.parse()?;
    }
    if let Ok(format) = std::env::var("TETHER_LOG_FORMAT") {
        config.format = format.parse()?;
    }
    if let Ok(path) = std::env::var("TETHER_LOG_FILE") {
        config.output = LogOutput::File {
            path: PathBuf::from(path),
        };
    }
    if std::env::var("NO_COLOR").is_ok() {
        config.enable_colors = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_ordering_and_tracing_mapping() {
        assert!(LogLevel::Warn > LogLevel::Info);
        assert_eq!(LogLevel::from(&Level::ERROR), LogLevel::Error);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.output, LogOutput::Stderr);
    }

    #[test]
    fn test_logger_builder() {
        let builder = LoggerBuilder::new()
            .level(LogLevel::Debug)
            .format(LogFormat::Json)
            .module_level("tether_host::dispatcher", LogLevel::Trace)
            .colors(false);

        assert_eq!(builder.config.level, LogLevel::Debug);
        assert_eq!(builder.config.format, LogFormat::Json);
        assert!(!builder.config.enable_colors);
        assert_eq!(
            builder.config.module_levels.get("tether_host::dispatcher"),
            Some(&LogLevel::Trace)
        );
    }

    #[test]
    fn test_logging_config_from_toml() {
        let config: LoggingConfig = toml::from_str(
            r#"
            level = "debug"
            format = "json"
            output = { type = "file", path = "/tmp/tether.log" }
            "#,
        )
        .unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.output,
            LogOutput::File {
                path: PathBuf::from("/tmp/tether.log")
            }
        );
        // Unspecified fields fall back to defaults
        assert!(config.include_thread_info);
    }
}
