//! Secret values as delivered by the secret service
//!
//! A [`Secret`] is an immutable snapshot: the decoded content together with
//! the unmodified payload it was decoded from. Refreshing a secret produces
//! a new value, it never mutates an existing one.

use std::time::SystemTime;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Per-secret payload as returned by the backend
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretPayload {
    name: String,
    /// Base64 encoded content
    #[serde(default)]
    secret: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    version: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("invalid secret payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("secret {name} has invalid base64 content: {source}")]
    Base64 {
        name: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// One secret, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    name: String,
    content: Bytes,
    raw: Bytes,
    owner: Option<String>,
    group: Option<String>,
    checksum: Option<String>,
    version: Option<i64>,
    fetched_at: SystemTime,
}

impl Secret {
    /// Create a secret from already decoded content.
    ///
    /// The raw payload is synthesized so that `.json` mirrors still have
    /// something faithful to show.
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let name = name.into();
        let content = content.into();
        let raw = serde_json::json!({
            "name": name,
            "secret": base64::engine::general_purpose::STANDARD.encode(&content),
            "secretLength": content.len(),
        });
        Self {
            raw: Bytes::from(raw.to_string()),
            name,
            content,
            owner: None,
            group: None,
            checksum: None,
            version: None,
            fetched_at: SystemTime::now(),
        }
    }

    /// Decode a backend payload, keeping the payload bytes untouched
    pub fn parse(raw: impl Into<Bytes>) -> Result<Self, SecretError> {
        let raw = raw.into();
        let payload: SecretPayload = serde_json::from_slice(&raw)?;
        let content = base64::engine::general_purpose::STANDARD
            .decode(payload.secret.trim())
            .map_err(|source| SecretError::Base64 {
                name: payload.name.clone(),
                source,
            })?;

        Ok(Self {
            name: payload.name,
            content: Bytes::from(content),
            raw,
            owner: non_empty(payload.owner),
            group: non_empty(payload.group),
            checksum: payload.checksum,
            version: payload.version,
            fetched_at: SystemTime::now(),
        })
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = non_empty(Some(owner.into()));
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = non_empty(Some(group.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decoded secret value
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Unmodified backend payload, including metadata
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Whether this secret is individually owned rather than shared
    pub fn has_explicit_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }
}

/// Entry of the backend's secret listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_length: Option<u64>,
}

impl From<&Secret> for SecretSummary {
    fn from(secret: &Secret) -> Self {
        Self {
            name: secret.name.clone(),
            owner: secret.owner.clone(),
            group: secret.group.clone(),
            checksum: secret.checksum.clone(),
            secret_length: Some(secret.content.len() as u64),
        }
    }
}

/// Full listing of secrets visible to this client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretListing {
    raw: Bytes,
    secrets: Vec<SecretSummary>,
}

impl SecretListing {
    pub fn parse(raw: impl Into<Bytes>) -> Result<Self, SecretError> {
        let raw = raw.into();
        let secrets = serde_json::from_slice(&raw)?;
        Ok(Self { raw, secrets })
    }

    /// Unmodified listing payload
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn secrets(&self) -> &[SecretSummary] {
        &self.secrets
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.secrets.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
