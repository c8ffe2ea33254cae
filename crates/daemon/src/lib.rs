pub mod cache;
pub mod client;
pub mod config;
pub mod fs;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod metrics;
pub mod ownership;

// Re-exports for the binary and embedders
pub use cache::{SecretCache, SecretCacheConfig};
pub use client::HttpBackend;
pub use config::{Config, Timeouts, TlsConfig};
pub use fs::SecretFs;
pub use ownership::Ownership;

/// Daemon-specific build info that uses the daemon's BUILD_FEATURES.
///
/// `common::version::BuildInfo::new()` reads the build environment of the
/// common crate, which never sees the daemon's feature set.
pub fn build_info() -> common::version::BuildInfo {
    let mut info = common::version::BuildInfo::new();
    info.build_features = option_env!("BUILD_FEATURES").unwrap_or("none").to_string();
    info.build_timestamp = option_env!("BUILD_TIMESTAMP").map(str::to_string);
    info
}
