mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use secretfs_daemon::cache::{SecretCache, SecretCacheConfig};
use secretfs_daemon::client::HttpBackend;
use secretfs_daemon::config::Config;
use secretfs_daemon::fs::SecretFs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = cli::Cli::parse().into_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(config.log_level().into()))
        .init();

    tracing::info!(
        version = %secretfs_daemon::build_info(),
        server = %config.server,
        mountpoint = %config.mountpoint.display(),
        "starting secretfs"
    );

    let ownership = config.ownership()?;
    let backend = HttpBackend::new(&config.server, &config.tls, config.timeouts.backend_timeout)
        .context("failed to set up the secret service client")?;
    let cache = SecretCache::new(
        Arc::new(backend),
        SecretCacheConfig {
            capacity: config.cache_capacity,
            timeouts: config.timeouts,
        },
    );
    let refresher = cache.spawn_refresher();
    let fs = SecretFs::new(cache, ownership, &config.mountpoint);

    let served = serve(fs, &config).await;
    refresher.shutdown().await;
    served
}

#[cfg(feature = "fuse")]
async fn serve(fs: SecretFs, config: &Config) -> anyhow::Result<()> {
    let session = secretfs_daemon::fuse::mount(fs, &config.mountpoint, config.allow_other)
        .map_err(|err| {
            tracing::error!(mountpoint = %config.mountpoint.display(), "mount failed: {err}");
            err
        })
        .with_context(|| format!("failed to mount {}", config.mountpoint.display()))?;

    shutdown_signal().await?;
    tracing::info!(mountpoint = %config.mountpoint.display(), "unmounting");
    // unmounting joins the FUSE thread
    tokio::task::spawn_blocking(move || drop(session)).await?;
    Ok(())
}

#[cfg(not(feature = "fuse"))]
async fn serve(_fs: SecretFs, _config: &Config) -> anyhow::Result<()> {
    anyhow::bail!("secretfs was built without FUSE support; rebuild with --features fuse")
}

#[cfg(feature = "fuse")]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
