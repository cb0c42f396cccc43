//! Local IPC endpoints
//!
//! An endpoint is either a Unix domain socket path or a loopback TCP address.
//! The textual forms accepted everywhere (config files, `TETHER_ENDPOINT`,
//! command-line flags) are:
//!
//! - `unix:/run/user/1000/tether/editor.sock`
//! - `tcp:127.0.0.1:7420`
//! - `127.0.0.1:7420` (anything that parses as a socket address)
//! - `/tmp/editor.sock` (an absolute path)

use crate::error::{ConfigError, TetherError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Default loopback port for the TCP fallback
pub const DEFAULT_TCP_PORT: u16 = 7420;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Platform default: a per-user socket on Unix, loopback TCP elsewhere
    pub fn platform_default() -> Self {
        #[cfg(unix)]
        {
            let path = match dirs::runtime_dir() {
                Some(runtime) => runtime.join("tether").join("editor.sock"),
                None => std::env::temp_dir().join("tether-editor.sock"),
            };
            Endpoint::Unix(path)
        }
        #[cfg(not(unix))]
        {
            Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)))
        }
    }

    pub fn parse(value: &str) -> Result<Self, TetherError> {
        let value = value.trim();
        let invalid = |reason: &str| {
            TetherError::Config(ConfigError::InvalidValue {
                key: "endpoint".to_string(),
                reason: reason.to_string(),
            })
        };

        if let Some(path) = value.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid("unix endpoint needs a socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        if let Some(addr) = value.strip_prefix("tcp:") {
            return addr
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|_| invalid("tcp endpoint needs host:port with a literal IP"));
        }

        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Ok(Endpoint::Tcp(addr));
        }

        let path = PathBuf::from(value);
        if path.is_absolute() {
            return Ok(Endpoint::Unix(path));
        }

        Err(invalid(
            "expected unix:<path>, tcp:<ip:port>, an ip:port or an absolute path",
        ))
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            Endpoint::Unix(_) => true,
            Endpoint::Tcp(addr) => addr.ip().is_loopback(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TetherError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::platform_default()
    }
}
