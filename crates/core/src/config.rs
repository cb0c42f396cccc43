//! Configuration management for tether

use crate::endpoint::Endpoint;
use crate::error::retry::RetryPolicy;
use crate::error::{ConfigError, Result, TetherError};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::logging::{LogLevel, LoggingConfig};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, FeatureSet, FrameCodec};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure for tether
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Client configuration
    pub client: ClientConfig,
    /// Host server configuration
    pub host: HostConfig,
    /// Limits shared by both peers
    pub limits: LimitsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Shared secret presented in `Hello`. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// Random 256-bit token, hex encoded
pub fn generate_token() -> Token {
    let bytes: [u8; 32] = rand::rng().random();
    Token(hex::encode(bytes))
}

/// Client-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where the host listens
    pub endpoint: Endpoint,
    /// Shared secret, usually supplied through `TETHER_TOKEN`
    pub token: Option<Token>,
    /// Connect + handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Default per-call timeout in milliseconds
    pub call_timeout_ms: u64,
    /// Features requested in `Hello`
    pub features: Vec<String>,
    /// Name reported in `Hello`
    pub client_name: String,
    /// Reconnect backoff
    pub retry: RetryPolicy,
}

/// Host server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Where to listen
    pub endpoint: Endpoint,
    /// Expected shared secret
    pub token: Option<Token>,
    /// Features the host offers
    pub features: Vec<String>,
    /// Concurrent connection limit
    pub max_connections: usize,
    /// Time a client gets to send `Hello`, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Main-thread tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Per-subscriber event queue bound
    pub event_capacity: usize,
    /// Least severe host log line republished to clients as a `Log` event
    pub forward_log_level: LogLevel,
    /// Name reported in `Welcome`
    pub host_name: String,
}

/// Limits shared by both peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest frame payload accepted or produced
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::platform_default(),
            token: None,
            connect_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            features: FeatureSet::all().to_wire(),
            client_name: "tether-client".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::platform_default(),
            token: None,
            features: FeatureSet::all().to_wire(),
            max_connections: 16,
            handshake_timeout_ms: 5_000,
            tick_interval_ms: 16,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            forward_log_level: LogLevel::Info,
            host_name: "tether-host".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl LimitsConfig {
    pub fn frame_codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_bytes)
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet::from_wire(&self.features)
    }
}

impl HostConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet::from_wire(&self.features)
    }
}

impl TetherConfig {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileError {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let config: TetherConfig = toml::from_str(&contents).map_err(|e| ConfigError::FileError {
            reason: format!("failed to parse {}: {}", path.display(), e),
        })?;

        info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::FileError {
            reason: format!("failed to serialize config: {}", e),
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Candidate config files, most specific first
    pub fn fallback_paths() -> Vec<PathBuf> {
        let mut config_paths = vec![PathBuf::from("tether.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            config_paths.push(config_dir.join("tether").join("config.toml"));
        }
        config_paths
    }

    /// Load the first readable config file, or defaults
    pub fn load_with_fallback() -> Self {
        for config_path in Self::fallback_paths() {
            if config_path.exists() {
                match Self::load_from_file(&config_path) {
                    Ok(config) => return config,
                    Err(e) => {
                        warn!(
                            "Failed to load config from {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
            }
        }

        debug!("No configuration file found, using defaults");
        Self::default()
    }

    /// Load from `path` when given, otherwise from the fallback paths, then apply
    /// environment overrides and validate
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_with_fallback(),
        };
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Merge configuration with `TETHER_*` environment variables
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(|key| std::env::var(key).ok())
    }

    /// Merge overrides from an arbitrary variable source
    pub fn merge_with_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("TETHER_ENDPOINT") {
            let endpoint = Endpoint::parse(&endpoint)?;
            self.client.endpoint = endpoint.clone();
            self.host.endpoint = endpoint;
        }

        if let Some(token) = lookup("TETHER_TOKEN") {
            let token = Token::new(token);
            self.client.token = Some(token.clone());
            self.host.token = Some(token);
        }

        if let Some(value) = lookup("TETHER_CONNECT_TIMEOUT_MS") {
            self.client.connect_timeout_ms = parse_number("TETHER_CONNECT_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = lookup("TETHER_CALL_TIMEOUT_MS") {
            self.client.call_timeout_ms = parse_number("TETHER_CALL_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = lookup("TETHER_MAX_FRAME_BYTES") {
            self.limits.max_frame_bytes = parse_number("TETHER_MAX_FRAME_BYTES", &value)?;
        }

        debug!("Configuration merged with environment variables");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.client.connect_timeout_ms == 0 {
            return Err(TetherError::config(
                "client.connect_timeout_ms",
                "must be greater than 0",
            ));
        }

        if self.client.call_timeout_ms == 0 {
            return Err(TetherError::config(
                "client.call_timeout_ms",
                "must be greater than 0",
            ));
        }

        if self.host.max_connections == 0 {
            return Err(TetherError::config(
                "host.max_connections",
                "must be greater than 0",
            ));
        }

        if self.host.tick_interval_ms == 0 {
            return Err(TetherError::config(
                "host.tick_interval_ms",
                "must be greater than 0",
            ));
        }

        if self.limits.max_frame_bytes < 1024 || self.limits.max_frame_bytes > u32::MAX as usize {
            return Err(TetherError::config(
                "limits.max_frame_bytes",
                "must be between 1 KiB and 4 GiB",
            ));
        }

        if !self.host.endpoint.is_loopback() || !self.client.endpoint.is_loopback() {
            return Err(TetherError::config(
                "endpoint",
                "only local endpoints are supported",
            ));
        }

        for token in [&self.client.token, &self.host.token].into_iter().flatten() {
            if token.is_empty() {
                return Err(TetherError::config("token", "must not be empty"));
            }
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        TetherError::Config(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "expected a non-negative integer".to_string(),
        })
    })
}
