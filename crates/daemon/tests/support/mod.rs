//! Shared setup for filesystem integration tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use common::MemoryBackend;
use secretfs_daemon::cache::{SecretCache, SecretCacheConfig};
use secretfs_daemon::config::Timeouts;
use secretfs_daemon::fs::SecretFs;
use secretfs_daemon::Ownership;

/// Mount-wide default owner used by every test filesystem
pub const SOME_UID: u32 = 12345;

pub const FIXTURES: [&str; 4] = [
    "secret.json",
    "secretNormalOwner.json",
    "secretVersioned.json",
    "secretNested.json",
];

pub fn fixture(name: &str) -> Bytes {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    Bytes::from(std::fs::read(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display())))
}

pub fn timeouts() -> Timeouts {
    Timeouts {
        poll_interval: Duration::from_secs(3600),
        fetch_wait: Duration::from_millis(10),
        max_wait: Duration::from_millis(200),
        backend_timeout: Duration::from_secs(1),
    }
}

/// Filesystem over a memory backend holding every fixture, with the
/// listing already published
pub async fn setup() -> (SecretFs, MemoryBackend) {
    let backend = MemoryBackend::new();
    for name in FIXTURES {
        backend.insert_payload(fixture(name)).unwrap();
    }

    let cache = SecretCache::new(
        Arc::new(backend.clone()),
        SecretCacheConfig {
            capacity: 100,
            timeouts: timeouts(),
        },
    );
    cache.refresh().await.unwrap();

    let fs = SecretFs::new(cache, Ownership::new(SOME_UID, SOME_UID), "/mnt/secrets");
    (fs, backend)
}
