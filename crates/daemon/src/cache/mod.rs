//! In-memory secret cache
//!
//! Sits between filesystem requests and the [`SecretBackend`]:
//!
//! # Architecture
//!
//! - **Entries**: immutable `Arc<Secret>` snapshots in a bounded moka cache,
//!   each stamped with the time it was fetched
//! - **Single-flight**: at most one backend fetch per name; concurrent
//!   requests await the same shared future
//! - **Listing**: the most recent secret listing and its name table,
//!   published by the background refresher
//! - **Refresher**: a tokio task that re-lists and renews aging
//!   entries on a fixed interval
//!
//! Requests favor availability: a stale snapshot is served whenever a
//! refresh cannot complete in time.

mod inflight;
mod refresh;

pub use refresh::{RefreshHandle, RefreshReport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use moka::sync::Cache;
use parking_lot::RwLock;
use tokio::time::Instant;

use common::{BackendError, NameTable, Secret, SecretBackend, SecretListing};

use crate::config::{Timeouts, DEFAULT_CACHE_CAPACITY};
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use inflight::{FetchResult, InFlight, SharedFetch};

/// Shortest interval the refresher will poll at
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshots stay fresh for this many refresh periods
const FRESH_PERIODS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("timed out waiting for secret: {0}")]
    Timeout(String),
}

/// One cached snapshot
#[derive(Debug, Clone)]
pub struct CacheEntry {
    secret: Arc<Secret>,
    refreshed_at: Instant,
}

impl CacheEntry {
    fn new(secret: Arc<Secret>) -> Self {
        Self {
            secret,
            refreshed_at: Instant::now(),
        }
    }

    pub fn secret(&self) -> &Arc<Secret> {
        &self.secret
    }

    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }
}

/// A published secret listing
#[derive(Debug, Default)]
pub struct Listing {
    listing: SecretListing,
    names: NameTable,
    fetched_at: Option<SystemTime>,
}

impl Listing {
    fn new(listing: SecretListing) -> Self {
        let names = NameTable::build(listing.names());
        Self {
            listing,
            names,
            fetched_at: Some(SystemTime::now()),
        }
    }

    /// Unmodified listing payload, empty until the first refresh
    pub fn raw(&self) -> &Bytes {
        self.listing.raw()
    }

    pub fn secrets(&self) -> &SecretListing {
        &self.listing
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn fetched_at(&self) -> Option<SystemTime> {
        self.fetched_at
    }
}

#[derive(Debug, Clone)]
pub struct SecretCacheConfig {
    /// Maximum number of cached secrets
    pub capacity: u64,
    pub timeouts: Timeouts,
}

impl Default for SecretCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            timeouts: Timeouts::default(),
        }
    }
}

#[derive(Clone)]
pub struct SecretCache {
    backend: Arc<dyn SecretBackend>,
    entries: Cache<String, CacheEntry>,
    listing: Arc<RwLock<Arc<Listing>>>,
    inflight: InFlight,
    /// Bumped by `clear()`; fetches started under an older generation
    /// do not repopulate the cache
    generation: Arc<AtomicU64>,
    metrics: Arc<CacheMetrics>,
    config: SecretCacheConfig,
}

impl std::fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCache")
            .field("backend", &self.backend)
            .field("entries", &self.entries.entry_count())
            .field("inflight", &self.inflight.len())
            .field("config", &self.config)
            .finish()
    }
}

impl SecretCache {
    pub fn new(backend: Arc<dyn SecretBackend>, config: SecretCacheConfig) -> Self {
        Self {
            backend,
            entries: Cache::builder().max_capacity(config.capacity).build(),
            listing: Arc::new(RwLock::new(Arc::new(Listing::default()))),
            inflight: InFlight::default(),
            generation: Arc::new(AtomicU64::new(0)),
            metrics: Arc::new(CacheMetrics::default()),
            config,
        }
    }

    pub fn config(&self) -> &SecretCacheConfig {
        &self.config
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.config.timeouts
    }

    /// Interval between background refresh passes
    pub fn refresh_period(&self) -> Duration {
        self.config.timeouts.poll_interval.max(MIN_POLL_INTERVAL)
    }

    /// Age at which a snapshot turns stale
    pub fn freshness(&self) -> Duration {
        self.refresh_period() * FRESH_PERIODS
    }

    /// Freshest available snapshot of `name`.
    ///
    /// Fresh entries are returned immediately. A stale entry triggers a
    /// refresh and is returned as-is if the refresh fails or does not land
    /// within `fetch_wait`, unless the backend reports the secret gone. A
    /// missing entry waits up to `max_wait` for the backend.
    pub async fn get(&self, name: &str) -> Result<Arc<Secret>, CacheError> {
        let cached = self.entries.get(name);
        if let Some(entry) = &cached {
            if entry.age() < self.freshness() {
                self.metrics.record_hit();
                return Ok(Arc::clone(&entry.secret));
            }
        }

        let fetch = self.fetch(name);
        match cached {
            Some(stale) => {
                match tokio::time::timeout(self.config.timeouts.fetch_wait, fetch).await {
                    Ok(Ok(secret)) => Ok(secret),
                    Ok(Err(BackendError::NotFound(_))) => {
                        Err(CacheError::NotFound(name.to_string()))
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(secret = name, "serving stale secret: {err}");
                        self.metrics.record_stale_hit();
                        Ok(stale.secret)
                    }
                    Err(_) => {
                        tracing::debug!(secret = name, "refresh still running, serving stale secret");
                        self.metrics.record_stale_hit();
                        Ok(stale.secret)
                    }
                }
            }
            None => {
                self.metrics.record_miss();
                match tokio::time::timeout(self.config.timeouts.max_wait, fetch).await {
                    Ok(Ok(secret)) => Ok(secret),
                    Ok(Err(err)) => {
                        tracing::debug!(secret = name, "fetch failed: {err}");
                        Err(CacheError::NotFound(name.to_string()))
                    }
                    Err(_) => {
                        tracing::warn!(
                            secret = name,
                            "no answer from backend within {:?}",
                            self.config.timeouts.max_wait
                        );
                        self.metrics.record_timeout();
                        Err(CacheError::Timeout(name.to_string()))
                    }
                }
            }
        }
    }

    /// Cached entry for `name`, without contacting the backend
    pub fn peek(&self, name: &str) -> Option<CacheEntry> {
        self.entries.get(name)
    }

    /// Most recently published listing. Never contacts the backend.
    pub fn list_all(&self) -> Arc<Listing> {
        self.listing.read().clone()
    }

    /// Raw names of every cached secret
    pub fn cached_names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn add(&self, secret: Secret) {
        let name = secret.name().to_string();
        self.entries.insert(name, CacheEntry::new(Arc::new(secret)));
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.invalidate(name);
    }

    /// Drop every cached secret
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
        tracing::info!("secret cache cleared");
    }

    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The backend's own status document
    pub async fn server_status(&self) -> Result<Bytes, BackendError> {
        let timeout = self.config.timeouts.backend_timeout;
        tokio::time::timeout(timeout, self.backend.server_status())
            .await
            .unwrap_or_else(|_| Err(timed_out("server status", timeout)))
    }

    fn publish_listing(&self, listing: SecretListing) {
        *self.listing.write() = Arc::new(Listing::new(listing));
    }

    /// Join or start the backend fetch for `name`
    pub(crate) fn fetch(&self, name: &str) -> SharedFetch {
        let (fetch, started) = self.inflight.join_or_start(name, || self.spawn_fetch(name));
        if !started {
            self.metrics.record_coalesced();
        }
        fetch
    }

    /// Run one backend fetch as its own task, so the result lands in the
    /// cache even when every waiter gave up
    fn spawn_fetch(&self, name: &str) -> BoxFuture<'static, FetchResult> {
        self.metrics.record_fetch();
        let cache = self.clone();
        let name = name.to_string();
        let generation = self.generation.load(Ordering::Acquire);

        let task = tokio::spawn(async move {
            let timeout = cache.config.timeouts.backend_timeout;
            let result = tokio::time::timeout(timeout, cache.backend.get_secret(&name))
                .await
                .unwrap_or_else(|_| Err(timed_out(&name, timeout)));

            let outcome = match result {
                Ok(secret) => {
                    let secret = Arc::new(secret);
                    if cache.generation.load(Ordering::Acquire) == generation {
                        cache
                            .entries
                            .insert(name.clone(), CacheEntry::new(Arc::clone(&secret)));
                    }
                    Ok(secret)
                }
                Err(err) => {
                    cache.metrics.record_fetch_failure();
                    if matches!(err, BackendError::NotFound(_)) {
                        // deleted upstream
                        cache.entries.invalidate(&name);
                    }
                    tracing::debug!(secret = %name, "backend fetch failed: {err}");
                    Err(err)
                }
            };
            cache.inflight.complete(&name);
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|err| Err(BackendError::Network(format!("fetch task failed: {err}"))))
        }
        .boxed()
    }
}

fn timed_out(what: &str, after: Duration) -> BackendError {
    BackendError::Network(format!("{what}: no response after {after:?}"))
}
