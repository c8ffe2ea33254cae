use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use serde::Serialize;

use common::name::NAME_MAX;
use common::version::{BuildInfo, VERSION};
use common::Secret;

use super::attrs::{self, Attributes, FileKind, DIRECTORY_SIZE};
use super::error::FsError;
use super::handle::FileHandle;
use super::router::{self, ControlFile, VirtualNode, JSON_DIR, JSON_SECRETS_FILE, JSON_SECRET_DIR, PROFILING_DIR};
use crate::cache::{CacheError, SecretCache};
use crate::config::Timeouts;
use crate::metrics::unix_seconds;
use crate::ownership::{IdentityCache, Ownership};

/// Filesystem name reported to the kernel
pub const FS_NAME: &str = "secretfs";

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileKind::RegularFile,
        }
    }

    fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Node resolved against the cache: attributes plus the content they describe
struct Resolved {
    attributes: Attributes,
    content: Option<Bytes>,
}

#[derive(Serialize)]
struct Status<'a> {
    build: BuildInfo,
    pid: u32,
    mountpoint: &'a Path,
    ownership: Ownership,
    timeouts: &'a Timeouts,
    cache: CacheStatus,
}

#[derive(Serialize)]
struct CacheStatus {
    capacity: u64,
    entries: u64,
    listed_secrets: usize,
    /// Unix seconds of the published listing
    listing_fetched_at: Option<u64>,
}

/// Path-based filesystem operations over a [`SecretCache`]
#[derive(Debug, Clone)]
pub struct SecretFs {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cache: SecretCache,
    identities: IdentityCache,
    ownership: Ownership,
    mountpoint: PathBuf,
    started_at: SystemTime,
}

impl SecretFs {
    pub fn new(cache: SecretCache, ownership: Ownership, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                identities: IdentityCache::new(),
                ownership,
                mountpoint: mountpoint.into(),
                started_at: SystemTime::now(),
            }),
        }
    }

    pub fn cache(&self) -> &SecretCache {
        &self.inner.cache
    }

    /// Default ownership of the mount
    pub fn ownership(&self) -> Ownership {
        self.inner.ownership
    }

    pub fn mountpoint(&self) -> &Path {
        &self.inner.mountpoint
    }

    pub fn route(&self, path: &str) -> VirtualNode {
        router::route(path, self.inner.cache.list_all().names())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn attributes(&self, path: &str) -> Result<Attributes, FsError> {
        Ok(self.resolve(path).await?.attributes)
    }

    /// Children of the directory at `path`, excluding `.` and `..`
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn open_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        match self.route(path) {
            VirtualNode::Root => {
                let mut entries: Vec<DirEntry> = ControlFile::ROOT
                    .iter()
                    .map(|control| DirEntry::file(control.name()))
                    .collect();
                entries.push(DirEntry::dir(JSON_DIR));
                entries.push(DirEntry::dir(PROFILING_DIR));
                entries.extend(self.secret_entries());
                Ok(entries)
            }
            VirtualNode::JsonDir => {
                let mut entries: Vec<DirEntry> = ControlFile::JSON
                    .iter()
                    .map(|control| DirEntry::file(control.name()))
                    .collect();
                entries.push(DirEntry::file(JSON_SECRETS_FILE));
                entries.push(DirEntry::dir(JSON_SECRET_DIR));
                Ok(entries)
            }
            VirtualNode::JsonSecretDir => Ok(self.secret_entries()),
            VirtualNode::ProfilingDir => Ok(Vec::new()),
            VirtualNode::NotFound => Err(FsError::NotFound(path.to_string())),
            VirtualNode::SecretFile { .. }
            | VirtualNode::JsonSecretFile { .. }
            | VirtualNode::JsonSecretsFile
            | VirtualNode::Control(_) => Err(FsError::NotADirectory(path.to_string())),
        }
    }

    /// Open the file at `path`, capturing its content.
    ///
    /// Only read-only access is granted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn open(&self, path: &str, flags: i32) -> Result<FileHandle, FsError> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(FsError::PermissionDenied(path.to_string()));
        }

        let resolved = self.resolve(path).await?;
        if resolved.attributes.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        Ok(FileHandle::new(
            resolved.attributes,
            resolved.content.unwrap_or_default(),
        ))
    }

    /// Remove `path`. Only `.clear_cache` may be unlinked, which flushes
    /// the cache and leaves the file in place.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        match self.route(path) {
            VirtualNode::Control(ControlFile::ClearCache) => {
                self.inner.cache.clear();
                Ok(())
            }
            _ => Err(FsError::PermissionDenied(path.to_string())),
        }
    }

    pub fn statfs(&self) -> StatFs {
        let bsize = DIRECTORY_SIZE as u32;
        StatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.known_secrets().len() as u64,
            ffree: 0,
            bsize,
            namelen: NAME_MAX as u32,
            frsize: bsize,
        }
    }

    /// Rendered `.json/status`
    pub fn status_json(&self) -> Bytes {
        let listing = self.inner.cache.list_all();
        let status = Status {
            build: crate::build_info(),
            pid: std::process::id(),
            mountpoint: &self.inner.mountpoint,
            ownership: self.inner.ownership,
            timeouts: self.inner.cache.timeouts(),
            cache: CacheStatus {
                capacity: self.inner.cache.config().capacity,
                entries: self.inner.cache.len(),
                listed_secrets: listing.secrets().len(),
                listing_fetched_at: listing.fetched_at().map(unix_seconds),
            },
        };
        render_json(&status)
    }

    /// Rendered `.json/metrics`
    pub fn metrics_json(&self) -> Bytes {
        render_json(&self.inner.cache.metrics())
    }

    /// Rendered `.json/secrets`, the listing exactly as the backend sent it
    pub fn secrets_json(&self) -> Bytes {
        let listing = self.inner.cache.list_all();
        match listing.fetched_at() {
            Some(_) => listing.raw().clone(),
            None => Bytes::from_static(b"[]"),
        }
    }

    /// Rendered `.running`
    pub fn running(&self) -> Bytes {
        Bytes::from(format!(
            "pid={}\nmountpoint={}\nstarted={}\n",
            std::process::id(),
            self.inner.mountpoint.display(),
            unix_seconds(self.inner.started_at),
        ))
    }

    async fn server_status_json(&self) -> Bytes {
        match self.inner.cache.server_status().await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!("backend status unavailable: {err}");
                render_json(&serde_json::json!({ "error": err.to_string() }))
            }
        }
    }

    async fn render(&self, control: ControlFile) -> Bytes {
        match control {
            ControlFile::Version => Bytes::from_static(VERSION.as_bytes()),
            ControlFile::Running => self.running(),
            ControlFile::ClearCache => Bytes::new(),
            ControlFile::Status => self.status_json(),
            ControlFile::Metrics => self.metrics_json(),
            ControlFile::ServerStatus => self.server_status_json().await,
        }
    }

    async fn secret(&self, name: &str, path: &str) -> Result<Arc<Secret>, FsError> {
        self.inner.cache.get(name).await.map_err(|err| match err {
            CacheError::NotFound(_) => FsError::NotFound(path.to_string()),
            CacheError::Timeout(_) => FsError::Busy(path.to_string()),
        })
    }

    async fn resolve(&self, path: &str) -> Result<Resolved, FsError> {
        let node = self.route(path);

        let (content, secret_owner) = match &node {
            VirtualNode::Root
            | VirtualNode::JsonDir
            | VirtualNode::JsonSecretDir
            | VirtualNode::ProfilingDir => (None, None),
            VirtualNode::Control(control) => (Some(self.render(*control).await), None),
            VirtualNode::JsonSecretsFile => (Some(self.secrets_json()), None),
            VirtualNode::JsonSecretFile { name } => {
                let secret = self.secret(name, path).await?;
                (Some(secret.raw().clone()), None)
            }
            VirtualNode::SecretFile { name } => {
                let secret = self.secret(name, path).await?;
                let owner = secret.has_explicit_owner().then(|| {
                    self.inner
                        .identities
                        .ownership_for(&secret, self.inner.ownership)
                });
                (Some(secret.content().clone()), owner)
            }
            VirtualNode::NotFound => return Err(FsError::NotFound(path.to_string())),
        };

        let size = content.as_ref().map_or(0, |c| c.len() as u64);
        let attributes = attrs::attributes_for(&node, size, secret_owner, self.inner.ownership)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(Resolved {
            attributes,
            content,
        })
    }

    /// Raw names of every secret that is listed or cached
    fn known_secrets(&self) -> BTreeSet<String> {
        let listing = self.inner.cache.list_all();
        listing
            .secrets()
            .names()
            .map(str::to_string)
            .chain(self.inner.cache.cached_names())
            .collect()
    }

    fn secret_entries(&self) -> Vec<DirEntry> {
        let listing = self.inner.cache.list_all();
        let names = listing.names();
        let entries: BTreeSet<String> = self
            .known_secrets()
            .iter()
            .map(|raw| names.entry_name(raw).into_owned())
            .collect();
        entries.into_iter().map(DirEntry::file).collect()
    }
}

impl std::fmt::Display for SecretFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(FS_NAME)
    }
}

fn render_json<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec_pretty(value) {
        Ok(mut json) => {
            json.push(b'\n');
            Bytes::from(json)
        }
        Err(err) => Bytes::from(format!("{{\"error\": \"{err}\"}}\n")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::MemoryBackend;

    use super::*;
    use crate::cache::SecretCacheConfig;

    async fn setup() -> (SecretFs, MemoryBackend) {
        let backend = MemoryBackend::new();
        backend.insert(&Secret::new("hmac.key", "s3cret"));
        let cache = SecretCache::new(
            Arc::new(backend.clone()),
            SecretCacheConfig {
                capacity: 100,
                timeouts: Timeouts {
                    poll_interval: Duration::from_secs(60),
                    fetch_wait: Duration::from_millis(100),
                    max_wait: Duration::from_secs(2),
                    backend_timeout: Duration::from_secs(2),
                },
            },
        );
        cache.refresh().await.unwrap();
        let fs = SecretFs::new(cache, Ownership::new(1000, 1000), "/run/secrets");
        (fs, backend)
    }

    #[tokio::test]
    async fn test_write_access_denied() {
        let (fs, _) = setup().await;

        for flags in [libc::O_WRONLY, libc::O_RDWR] {
            assert_eq!(
                fs.open("hmac.key", flags).await.unwrap_err(),
                FsError::PermissionDenied("hmac.key".into())
            );
        }
        assert!(fs.open("hmac.key", libc::O_RDONLY).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_directory_on_file() {
        let (fs, _) = setup().await;

        assert_eq!(
            fs.open_directory(".version").await.unwrap_err(),
            FsError::NotADirectory(".version".into())
        );
        assert!(fs.open_directory(".pprof").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_and_status() {
        let (fs, _) = setup().await;

        let running = String::from_utf8(fs.running().to_vec()).unwrap();
        assert!(running.starts_with(&format!("pid={}\n", std::process::id())));
        assert!(running.contains("mountpoint=/run/secrets\n"));

        let status: serde_json::Value = serde_json::from_slice(&fs.status_json()).unwrap();
        assert_eq!(status["pid"], std::process::id());
        assert_eq!(status["cache"]["listed_secrets"], 1);
        assert_eq!(status["build"]["version"], VERSION);
        assert_eq!(status["timeouts"]["max_wait_ms"], 2000);
    }

    #[tokio::test]
    async fn test_server_status_error_is_rendered() {
        let (fs, backend) = setup().await;
        backend.set_offline(true);

        let handle = fs.open(".json/server_status", libc::O_RDONLY).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(handle.content()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_secrets_listing_is_json_before_first_refresh() {
        let backend = MemoryBackend::new();
        backend.insert(&Secret::new("hmac.key", "s3cret"));
        let cache = SecretCache::new(Arc::new(backend.clone()), SecretCacheConfig::default());
        let fs = SecretFs::new(cache.clone(), Ownership::new(1000, 1000), "/run/secrets");

        let attrs = fs.attributes(".json/secrets").await.unwrap();
        assert_eq!(attrs.size, 2);
        let handle = fs.open(".json/secrets", libc::O_RDONLY).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(handle.content()).unwrap();
        assert_eq!(body, serde_json::json!([]));

        cache.refresh().await.unwrap();
        let handle = fs.open(".json/secrets", libc::O_RDONLY).await.unwrap();
        assert_eq!(handle.content(), cache.list_all().raw());
    }

    #[tokio::test]
    async fn test_statfs_counts_secrets() {
        let (fs, _) = setup().await;
        let stat = fs.statfs();

        assert_eq!(stat.files, 1);
        assert_eq!(stat.bsize, 4096);
        assert_eq!(stat.namelen, 255);
        assert_eq!(fs.to_string(), "secretfs");
    }
}
