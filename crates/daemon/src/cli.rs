use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use secretfs_daemon::config::{Config, ConfigError, TlsConfig};

/// Mount secrets from a remote secret service as read-only files
#[derive(Parser, Debug, Clone)]
#[command(name = "secretfs", version, about)]
pub struct Cli {
    /// TOML config file; flags override its values
    #[arg(long, env = "SECRETFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base URL of the secret service
    #[arg(env = "SECRETFS_SERVER")]
    pub server: Option<Url>,

    /// Directory to mount the secrets at
    #[arg(env = "SECRETFS_MOUNTPOINT")]
    pub mountpoint: Option<PathBuf>,

    /// PEM client certificate
    #[arg(long, env = "SECRETFS_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM client private key
    #[arg(long, env = "SECRETFS_KEY")]
    pub key: Option<PathBuf>,

    /// PEM bundle of trusted roots, replacing the built-in ones
    #[arg(long, env = "SECRETFS_CA")]
    pub ca: Option<PathBuf>,

    /// Default owner of every entry (name or uid)
    #[arg(long, env = "SECRETFS_USER")]
    pub user: Option<String>,

    /// Default group of every entry (name or gid)
    #[arg(long, env = "SECRETFS_GROUP")]
    pub group: Option<String>,

    /// Background refresh interval; snapshots stay fresh for two intervals
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Wait on the refresh of a stale secret before serving it anyway
    #[arg(long, value_name = "MS")]
    pub fetch_wait_ms: Option<u64>,

    /// Wait on a first-time fetch before failing with EAGAIN
    #[arg(long, value_name = "MS")]
    pub max_wait_ms: Option<u64>,

    /// Timeout of each backend request
    #[arg(long, value_name = "MS")]
    pub backend_timeout_ms: Option<u64>,

    /// Maximum number of cached secrets
    #[arg(long)]
    pub cache_capacity: Option<u64>,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Enable debug logging
    #[arg(long, env = "SECRETFS_DEBUG")]
    pub debug: bool,
}

impl Cli {
    /// Merge the config file, if any, with the flags
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::new(
                self.server.clone().ok_or(ConfigError::Missing("server"))?,
                self.mountpoint
                    .clone()
                    .ok_or(ConfigError::Missing("mountpoint"))?,
                TlsConfig {
                    client_cert: self.cert.clone().ok_or(ConfigError::Missing("cert"))?,
                    client_key: self.key.clone().ok_or(ConfigError::Missing("key"))?,
                    ca_bundle: None,
                },
            ),
        };

        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(mountpoint) = self.mountpoint {
            config.mountpoint = mountpoint;
        }
        if let Some(cert) = self.cert {
            config.tls.client_cert = cert;
        }
        if let Some(key) = self.key {
            config.tls.client_key = key;
        }
        if self.ca.is_some() {
            config.tls.ca_bundle = self.ca;
        }
        if self.user.is_some() {
            config.user = self.user;
        }
        if self.group.is_some() {
            config.group = self.group;
        }

        let timeouts = &mut config.timeouts;
        let overrides = [
            (&mut timeouts.poll_interval, self.poll_interval_ms),
            (&mut timeouts.fetch_wait, self.fetch_wait_ms),
            (&mut timeouts.max_wait, self.max_wait_ms),
            (&mut timeouts.backend_timeout, self.backend_timeout_ms),
        ];
        for (field, ms) in overrides {
            if let Some(ms) = ms {
                *field = Duration::from_millis(ms);
            }
        }

        if let Some(capacity) = self.cache_capacity {
            config.cache_capacity = capacity;
        }
        config.allow_other |= self.allow_other;
        config.debug |= self.debug;

        config.validate()?;
        Ok(config)
    }
}
