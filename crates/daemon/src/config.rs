//! Daemon configuration
//!
//! Loaded from a TOML file and/or assembled from command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use url::Url;

use crate::ownership::Ownership;

pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid timeouts: {0}")]
    InvalidTimeouts(String),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
}

/// The four durations governing cache freshness and backend waits
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Background refresh cadence. A cached secret older than this is stale.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// How long a request waits on the refresh of a stale secret before
    /// the stale snapshot is served instead
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "fetch_wait_ms")]
    pub fetch_wait: Duration,
    /// How long a request waits for a secret that was never cached
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_wait_ms")]
    pub max_wait: Duration,
    /// Bound on any single backend call
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "backend_timeout_ms")]
    pub backend_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            fetch_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(20),
            backend_timeout: Duration::from_secs(20),
        }
    }
}

impl Timeouts {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("poll_interval", self.poll_interval),
            ("fetch_wait", self.fetch_wait),
            ("max_wait", self.max_wait),
            ("backend_timeout", self.backend_timeout),
        ];
        if let Some((name, _)) = named.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::InvalidTimeouts(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.fetch_wait > self.max_wait {
            return Err(ConfigError::InvalidTimeouts(format!(
                "fetch_wait ({:?}) exceeds max_wait ({:?})",
                self.fetch_wait, self.max_wait
            )));
        }
        Ok(())
    }
}

/// Client identity used to authenticate against the secret service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    /// Trust only these roots instead of the built-in ones
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server: Url,
    pub mountpoint: PathBuf,
    pub tls: TlsConfig,
    /// Default owner of every entry, as a name or numeric id
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default)]
    pub allow_other: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY
}

impl Config {
    pub fn new(server: Url, mountpoint: impl Into<PathBuf>, tls: TlsConfig) -> Self {
        Self {
            server,
            mountpoint: mountpoint.into(),
            tls,
            user: None,
            group: None,
            timeouts: Timeouts::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            allow_other: false,
            debug: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mountpoint.as_os_str().is_empty() {
            return Err(ConfigError::Missing("mountpoint"));
        }
        self.timeouts.validate()
    }

    /// Resolve the configured default owner to numeric ids
    pub fn ownership(&self) -> Result<Ownership, ConfigError> {
        Ownership::resolve(self.user.as_deref(), self.group.as_deref())
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
