//! Mutually authenticated HTTP client for the secret service

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Certificate, Client, Identity, StatusCode};
use url::Url;

use common::{BackendError, Secret, SecretBackend, SecretListing};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to read {path}: {source}")]
    ReadPem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("{0} cannot be used as a base url")]
    InvalidServer(Url),
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    remote: Url,
    client: Client,
}

impl HttpBackend {
    /// Client presenting the configured certificate on every request
    pub fn new(remote: &Url, tls: &TlsConfig, timeout: Duration) -> Result<Self, ClientError> {
        let mut identity = read_pem(&tls.client_cert)?;
        identity.push(b'\n');
        identity.extend(read_pem(&tls.client_key)?);

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = Client::builder()
            .use_rustls_tls()
            .identity(Identity::from_pem(&identity)?)
            .default_headers(default_headers)
            .timeout(timeout);

        if let Some(ca_bundle) = &tls.ca_bundle {
            builder = builder.tls_built_in_root_certs(false);
            for cert in Certificate::from_pem_bundle(&read_pem(ca_bundle)?)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        Self::with_client(remote, builder.build()?)
    }

    /// Wrap an already configured client
    pub fn with_client(remote: &Url, client: Client) -> Result<Self, ClientError> {
        if remote.cannot_be_a_base() {
            return Err(ClientError::InvalidServer(remote.clone()));
        }
        Ok(Self {
            remote: remote.clone(),
            client,
        })
    }

    /// `segments` appended to the server URL, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.remote.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn fetch(&self, url: Url, what: &str) -> Result<Bytes, BackendError> {
        tracing::trace!(%url, "backend request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BackendError::Network(format!("{what}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify(status, what));
        }
        response
            .bytes()
            .await
            .map_err(|err| BackendError::Network(format!("{what}: {err}")))
    }
}

#[async_trait]
impl SecretBackend for HttpBackend {
    async fn list_secrets(&self) -> Result<SecretListing, BackendError> {
        let raw = self.fetch(self.endpoint(&["secrets"]), "secret listing").await?;
        Ok(SecretListing::parse(raw)?)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, BackendError> {
        let raw = self.fetch(self.endpoint(&["secret", name]), name).await?;
        Ok(Secret::parse(raw)?)
    }

    async fn server_status(&self) -> Result<Bytes, BackendError> {
        self.fetch(self.endpoint(&["_status"]), "server status").await
    }
}

fn classify(status: StatusCode, what: &str) -> BackendError {
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Auth(format!("{what}: {status}"))
        }
        _ => BackendError::Network(format!("{what}: unexpected status {status}")),
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|source| ClientError::ReadPem {
        path: path.to_path_buf(),
        source,
    })
}
