#![deny(unsafe_code)]

//! Configuration loading and validation for onionctl.
//!
//! Loads TOML configuration files describing which control endpoint to talk
//! to and how the event reader queues replies. Provides [`AppConfig`] as the
//! central configuration structure and [`Endpoint`] as the resolved endpoint
//! descriptor consumed by the transport layer.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default address of a tor control port.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1";

/// Default tor control port.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Default location of tor's control socket file.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/tor/control";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Where a control connection is made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// A TCP control port.
    Port {
        #[serde(default = "default_control_addr")]
        address: String,
        #[serde(default = "default_control_port")]
        port: u16,
    },
    /// A Unix domain control socket.
    SocketFile {
        #[serde(default = "default_socket_path")]
        path: PathBuf,
    },
}

impl Endpoint {
    /// A control port endpoint.
    pub fn port(address: impl Into<String>, port: u16) -> Self {
        Self::Port {
            address: address.into(),
            port,
        }
    }

    /// A control socket file endpoint.
    pub fn socket_file(path: impl Into<PathBuf>) -> Self {
        Self::SocketFile { path: path.into() }
    }

    /// Check that the endpoint can be connected to at all.
    ///
    /// The address of a port endpoint must be an IP literal; hostnames are
    /// not resolved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Port { address, port } => {
                if address.is_empty() {
                    return Err(ConfigError::Validation(
                        "control.address must not be empty".to_string(),
                    ));
                }
                if address.parse::<IpAddr>().is_err() {
                    return Err(ConfigError::Validation(format!(
                        "control.address must be an IP address, got {address:?}"
                    )));
                }
                if *port == 0 {
                    return Err(ConfigError::Validation(
                        "control.port must be non-zero".to_string(),
                    ));
                }
            }
            Self::SocketFile { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Validation(
                        "control.path must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Port {
            address: default_control_addr(),
            port: default_control_port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port { address, port } => match address.parse::<IpAddr>() {
                Ok(IpAddr::V6(_)) => write!(f, "[{address}]:{port}"),
                _ => write!(f, "{address}:{port}"),
            },
            Self::SocketFile { path } => write!(f, "{}", path.display()),
        }
    }
}

fn default_control_addr() -> String {
    DEFAULT_CONTROL_ADDR.to_string()
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Control endpoint.
    #[serde(default)]
    pub control: Endpoint,

    /// Event reader configuration.
    #[serde(default)]
    pub reader: ReaderConfig,
}

/// Configuration for the background event reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Number of replies buffered between the receive loop and callers
    /// waiting on a response.
    #[serde(default = "default_reply_queue")]
    pub reply_queue: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            reply_queue: default_reply_queue(),
        }
    }
}

fn default_reply_queue() -> usize {
    64
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), endpoint = %config.control, "loaded config");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control.validate()?;
        if self.reader.reply_queue == 0 {
            return Err(ConfigError::Validation(
                "reader.reply_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
