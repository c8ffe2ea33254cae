//! Background refresh of the secret cache

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use common::BackendError;

use super::{timed_out, SecretCache};

/// Outcome of one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Secrets in the new listing
    pub listed: usize,
    /// Cached secrets fetched again
    pub refreshed: usize,
    /// Refetches that failed; their previous snapshots are kept
    pub failed: usize,
    /// Cached secrets dropped because they are no longer listed
    pub dropped: usize,
}

impl SecretCache {
    /// Run a single refresh pass.
    ///
    /// Publishes a new listing, drops cached secrets the backend no longer
    /// lists and refetches listed ones that are older than half a refresh
    /// period or whose checksum changed. A failed listing leaves the cache
    /// untouched.
    pub async fn refresh(&self) -> Result<RefreshReport, BackendError> {
        self.metrics.record_refresh();

        let timeout = self.config.timeouts.backend_timeout;
        let listing = match tokio::time::timeout(timeout, self.backend.list_secrets()).await {
            Ok(Ok(listing)) => listing,
            Ok(Err(err)) => return Err(self.refresh_failed(err)),
            Err(_) => return Err(self.refresh_failed(timed_out("secret listing", timeout))),
        };

        let mut report = RefreshReport {
            listed: listing.len(),
            ..Default::default()
        };

        let listed: HashSet<&str> = listing.names().collect();
        for name in self.cached_names() {
            if !listed.contains(name.as_str()) {
                self.entries.invalidate(&name);
                report.dropped += 1;
            }
        }

        // renewed here, an entry cannot turn stale before the next pass
        let renew_after = self.refresh_period() / 2;
        let outdated: Vec<String> = listing
            .secrets()
            .iter()
            .filter(|summary| match self.entries.get(&summary.name) {
                Some(entry) => {
                    entry.age() >= renew_after
                        || (summary.checksum.is_some()
                            && summary.checksum.as_deref() != entry.secret().checksum())
                }
                None => false,
            })
            .map(|summary| summary.name.clone())
            .collect();

        self.publish_listing(listing);

        let fetches = outdated.iter().map(|name| self.fetch(name));
        for result in futures::future::join_all(fetches).await {
            match result {
                Ok(_) => report.refreshed += 1,
                Err(_) => report.failed += 1,
            }
        }

        self.metrics.record_refresh_success();
        tracing::debug!(
            listed = report.listed,
            refreshed = report.refreshed,
            failed = report.failed,
            dropped = report.dropped,
            "refresh complete"
        );
        Ok(report)
    }

    fn refresh_failed(&self, err: BackendError) -> BackendError {
        tracing::warn!("secret refresh failed, keeping cached state: {err}");
        self.metrics.record_refresh_failure(&err);
        err
    }

    /// Start the background refresher. The first pass runs immediately.
    pub fn spawn_refresher(&self) -> RefreshHandle {
        let period = self.refresh_period();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn(run(self.clone(), period, shutdown_rx));
        tracing::info!(interval = ?period, "secret refresher started");
        RefreshHandle {
            shutdown_tx,
            task: Some(task),
        }
    }
}

async fn run(cache: SecretCache, period: Duration, mut shutdown_rx: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                // failures are recorded in the metrics and logged
                let _ = cache.refresh().await;
            }
        }
    }
    tracing::info!("secret refresher stopped");
}

/// Owner of the background refresher; dropping it stops the task
#[derive(Debug)]
pub struct RefreshHandle {
    shutdown_tx: watch::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Stop the refresher and wait for the current pass to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!("secret refresher panicked: {err}");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{MemoryBackend, Secret};

    use super::*;
    use crate::cache::SecretCacheConfig;
    use crate::config::Timeouts;

    fn setup() -> (SecretCache, MemoryBackend) {
        let backend = MemoryBackend::new();
        let cache = SecretCache::new(
            Arc::new(backend.clone()),
            SecretCacheConfig {
                capacity: 100,
                timeouts: Timeouts {
                    poll_interval: Duration::from_secs(10),
                    fetch_wait: Duration::from_millis(100),
                    max_wait: Duration::from_secs(1),
                    backend_timeout: Duration::from_secs(5),
                },
            },
        );
        (cache, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_publishes_listing() {
        let (cache, backend) = setup();
        backend.insert(&Secret::new("a", "1"));
        backend.insert(&Secret::new("b/c", "2"));

        let report = cache.refresh().await.unwrap();
        assert_eq!(report.listed, 2);
        assert_eq!(report.refreshed, 0);

        let listing = cache.list_all();
        assert_eq!(listing.secrets().len(), 2);
        assert!(listing.fetched_at().is_some());
        let entry = listing.names().entry_name("b/c").into_owned();
        assert_eq!(listing.names().raw_name(&entry), "b/c");
        // listing alone does not populate secrets
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_refetches_stale_and_drops_unlisted() {
        let (cache, backend) = setup();
        backend.insert(&Secret::new("keep", "old"));
        backend.insert(&Secret::new("gone", "x"));
        cache.get("keep").await.unwrap();
        cache.get("gone").await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        backend.insert(&Secret::new("keep", "new"));
        backend.remove("gone");

        let report = cache.refresh().await.unwrap();
        assert_eq!(
            report,
            RefreshReport {
                listed: 1,
                refreshed: 1,
                failed: 0,
                dropped: 1
            }
        );
        assert!(cache.peek("gone").is_none());
        let keep = cache.peek("keep").unwrap();
        assert_eq!(keep.secret().content().as_ref(), b"new");
        assert!(keep.age() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_leaves_fresh_entries_alone() {
        let (cache, backend) = setup();
        backend.insert(&Secret::new("a", "1"));
        cache.get("a").await.unwrap();

        let report = cache.refresh().await.unwrap();
        assert_eq!(report.refreshed, 0);
        assert_eq!(backend.fetch_count("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_listing_keeps_state() {
        let (cache, backend) = setup();
        backend.insert(&Secret::new("a", "1"));
        cache.refresh().await.unwrap();
        cache.get("a").await.unwrap();

        backend.set_offline(true);
        assert!(matches!(
            cache.refresh().await,
            Err(BackendError::Network(_))
        ));

        assert_eq!(cache.list_all().secrets().len(), 1);
        assert_eq!(cache.len(), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.refresh_failures, 1);
        assert!(metrics.last_refresh_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_polls_until_shutdown() {
        let (cache, backend) = setup();
        backend.insert(&Secret::new("a", "1"));

        let handle = cache.spawn_refresher();
        tokio::time::sleep(Duration::from_secs(25)).await;
        // immediate first pass plus ticks at 10s and 20s
        assert_eq!(backend.listing_count(), 3);
        assert_eq!(cache.list_all().secrets().len(), 1);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.listing_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_keeps_entries_fresh_under_latency() {
        let (cache, backend) = setup();
        backend.insert(&Secret::new("a", "1"));
        backend.set_latency(Some(Duration::from_millis(50)));
        cache.get("a").await.unwrap();

        let handle = cache.spawn_refresher();
        for _ in 0..24 {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cache.get("a").await.unwrap();
            assert!(cache.peek("a").unwrap().age() < cache.freshness());
        }

        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 24);
        assert_eq!(metrics.stale_hits, 0);
        // every pass after the first renews the entry
        assert!(backend.fetch_count("a") >= 6);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_refresher() {
        let (cache, backend) = setup();
        let handle = cache.spawn_refresher();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(handle);

        let before = backend.listing_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.listing_count(), before);
    }
}
