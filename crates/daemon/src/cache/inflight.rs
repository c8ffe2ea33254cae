//! Per-name coordination of backend fetches

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use common::{BackendError, Secret};

pub(crate) type FetchResult = Result<Arc<Secret>, BackendError>;
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Fetches currently running against the backend, at most one per name
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    fetches: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl InFlight {
    /// Attach to the running fetch for `name`, or start one with `start`.
    ///
    /// Returns the shared fetch and whether this call started it. `start`
    /// runs under the map lock, so two callers can never both start.
    pub fn join_or_start<F>(&self, name: &str, start: F) -> (SharedFetch, bool)
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let mut fetches = self.fetches.lock();
        if let Some(fetch) = fetches.get(name) {
            return (fetch.clone(), false);
        }
        let fetch = start().shared();
        fetches.insert(name.to_string(), fetch.clone());
        (fetch, true)
    }

    /// Forget the fetch for `name` once it has produced its result
    pub fn complete(&self, name: &str) {
        self.fetches.lock().remove(name);
    }

    pub fn len(&self) -> usize {
        self.fetches.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_caller_joins() {
        let inflight = InFlight::default();
        let secret = Arc::new(Secret::new("a", "1"));

        let ready = Arc::clone(&secret);
        let (first, started) =
            inflight.join_or_start("a", move || async move { Ok::<_, BackendError>(ready) }.boxed());
        assert!(started);

        let (second, started) = inflight.join_or_start("a", || {
            async { Err::<Arc<Secret>, _>(BackendError::NotFound("a".into())) }.boxed()
        });
        assert!(!started);
        assert_eq!(inflight.len(), 1);

        assert_eq!(first.await.unwrap(), secret);
        assert_eq!(second.await.unwrap(), secret);

        inflight.complete("a");
        assert_eq!(inflight.len(), 0);
    }
}
