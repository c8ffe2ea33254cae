//! Contract for the remote secret service
//!
//! The filesystem never talks to the network directly; it goes through a
//! [`SecretBackend`]. The production implementation is a mutually
//! authenticated HTTP client, [`MemoryBackend`] serves secrets from memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::secret::{Secret, SecretError, SecretListing, SecretSummary};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached or did not answer in time
    #[error("network error: {0}")]
    Network(String),
    /// The backend does not know the requested secret
    #[error("secret not found: {0}")]
    NotFound(String),
    /// The backend rejected our credentials
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// The backend answered with something we could not decode
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl From<SecretError> for BackendError {
    fn from(err: SecretError) -> Self {
        BackendError::Malformed(err.to_string())
    }
}

#[async_trait]
pub trait SecretBackend: Send + Sync + std::fmt::Debug + 'static {
    /// List every secret visible to this client
    async fn list_secrets(&self) -> Result<SecretListing, BackendError>;

    /// Fetch a single secret by its raw name
    async fn get_secret(&self, name: &str) -> Result<Secret, BackendError>;

    /// The backend's own status document
    async fn server_status(&self) -> Result<Bytes, BackendError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    payloads: BTreeMap<String, Bytes>,
    offline: bool,
    latency: Option<Duration>,
    fetches: HashMap<String, usize>,
    listings: usize,
}

/// Secret service held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw per-secret payload, replacing any secret of the same name
    pub fn insert_payload(&self, raw: impl Into<Bytes>) -> Result<String, SecretError> {
        let raw = raw.into();
        let name = Secret::parse(raw.clone())?.name().to_string();
        self.inner.write().payloads.insert(name.clone(), raw);
        Ok(name)
    }

    pub fn insert(&self, secret: &Secret) {
        self.inner
            .write()
            .payloads
            .insert(secret.name().to_string(), secret.raw().clone());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.inner.write().payloads.remove(name).is_some()
    }

    /// Make every call fail with a network error
    pub fn set_offline(&self, offline: bool) {
        self.inner.write().offline = offline;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.write().latency = latency;
    }

    /// Number of `get_secret` calls made for `name`
    pub fn fetch_count(&self, name: &str) -> usize {
        self.inner.read().fetches.get(name).copied().unwrap_or(0)
    }

    /// Number of `list_secrets` calls made
    pub fn listing_count(&self) -> usize {
        self.inner.read().listings
    }

    async fn simulate_network(&self) -> Result<(), BackendError> {
        let (latency, offline) = {
            let inner = self.inner.read();
            (inner.latency, inner.offline)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            tracing::warn!("memory backend is offline, failing request");
            return Err(BackendError::Network("backend offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn list_secrets(&self) -> Result<SecretListing, BackendError> {
        self.inner.write().listings += 1;
        self.simulate_network().await?;

        let summaries = {
            let inner = self.inner.read();
            inner
                .payloads
                .values()
                .map(|raw| Secret::parse(raw.clone()).map(|s| SecretSummary::from(&s)))
                .collect::<Result<Vec<_>, _>>()?
        };
        let raw = serde_json::to_vec(&summaries)
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(SecretListing::parse(raw)?)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, BackendError> {
        *self
            .inner
            .write()
            .fetches
            .entry(name.to_string())
            .or_default() += 1;
        self.simulate_network().await?;

        let raw = self.inner.read().payloads.get(name).cloned();
        match raw {
            Some(raw) => Ok(Secret::parse(raw)?),
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    async fn server_status(&self) -> Result<Bytes, BackendError> {
        self.simulate_network().await?;
        let secrets = self.inner.read().payloads.len();
        let status = serde_json::json!({ "status": "ok", "secrets": secrets });
        Ok(Bytes::from(status.to_string()))
    }
}
