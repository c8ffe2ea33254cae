//! Cache counters rendered at `.json/metrics`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    fetch_failures: AtomicU64,
    timeouts: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    last_refresh: Mutex<Option<SystemTime>>,
    last_refresh_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub coalesced: u64,
    pub fetch_failures: u64,
    pub timeouts: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    /// Unix seconds of the last successful refresh
    pub last_refresh: Option<u64>,
    pub last_refresh_error: Option<String>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        bump(&self.hits);
    }

    pub fn record_stale_hit(&self) {
        bump(&self.stale_hits);
    }

    pub fn record_miss(&self) {
        bump(&self.misses);
    }

    pub fn record_fetch(&self) {
        bump(&self.fetches);
    }

    /// A request attached to a fetch already in flight
    pub fn record_coalesced(&self) {
        bump(&self.coalesced);
    }

    pub fn record_fetch_failure(&self) {
        bump(&self.fetch_failures);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn record_refresh(&self) {
        bump(&self.refreshes);
    }

    pub fn record_refresh_success(&self) {
        *self.last_refresh.lock() = Some(SystemTime::now());
        *self.last_refresh_error.lock() = None;
    }

    pub fn record_refresh_failure(&self, error: impl ToString) {
        bump(&self.refresh_failures);
        *self.last_refresh_error.lock() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            hits: load(&self.hits),
            stale_hits: load(&self.stale_hits),
            misses: load(&self.misses),
            fetches: load(&self.fetches),
            coalesced: load(&self.coalesced),
            fetch_failures: load(&self.fetch_failures),
            timeouts: load(&self.timeouts),
            refreshes: load(&self.refreshes),
            refresh_failures: load(&self.refresh_failures),
            last_refresh: self.last_refresh.lock().map(unix_seconds),
            last_refresh_error: self.last_refresh_error.lock().clone(),
        }
    }
}

pub(crate) fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_error_cleared_on_success() {
        let metrics = CacheMetrics::default();
        metrics.record_refresh();
        metrics.record_refresh_failure("backend offline");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.refreshes, 1);
        assert_eq!(snapshot.refresh_failures, 1);
        assert_eq!(snapshot.last_refresh_error.as_deref(), Some("backend offline"));
        assert_eq!(snapshot.last_refresh, None);

        metrics.record_refresh();
        metrics.record_refresh_success();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.refreshes, 2);
        assert_eq!(snapshot.last_refresh_error, None);
        assert!(snapshot.last_refresh.is_some());
    }
}
