use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, KernelConfig, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use libc::c_int;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::InodeTable;
use crate::fs::{Attributes, DirEntry, FileHandle, FileKind, FsError, SecretFs, FS_NAME};

/// How long the kernel may cache attributes and entries
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

/// Mount `fs` at `mountpoint` on a background thread.
///
/// Must be called from within a tokio runtime; requests are served on it.
/// The filesystem is unmounted when the returned session is dropped.
pub fn mount(
    fs: SecretFs,
    mountpoint: &Path,
    allow_other: bool,
) -> std::io::Result<fuser::BackgroundSession> {
    let runtime = Handle::try_current().map_err(std::io::Error::other)?;

    let mut options = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(FS_NAME.to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::NoExec,
        MountOption::AutoUnmount,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }

    tracing::info!(mountpoint = %mountpoint.display(), allow_other, "mounting secret filesystem");
    fuser::spawn_mount2(Session::new(fs, runtime), mountpoint, &options)
}

/// A connected FUSE session.
///
/// Receives kernel requests and arranges for their execution on the
/// tokio runtime.
pub struct Session {
    inner: Arc<SessionInner>,
    runtime: Handle,
}

impl Session {
    pub fn new(fs: SecretFs, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(SessionInner::new(fs)),
            runtime,
        }
    }
}

#[derive(Debug, Clone)]
struct Listed {
    ino: u64,
    kind: FileType,
    name: String,
}

enum OpenHandle {
    File(FileHandle),
    Directory(Arc<Vec<Listed>>),
}

struct SessionInner {
    fs: SecretFs,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_handle: AtomicU64,
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err: FsError = $err;
        tracing::debug!("{err}");
        $reply.error(err.os_error());
        return;
    }};
}

impl SessionInner {
    fn new(fs: SecretFs) -> Self {
        Self {
            fs,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn path(&self, ino: u64) -> Result<String, FsError> {
        self.inodes
            .lock()
            .get_path(ino)
            .map(str::to_string)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    fn allocate_handle(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        fh
    }

    fn file_attr(&self, ino: u64, attrs: &Attributes) -> FileAttr {
        let now = SystemTime::now();
        let (kind, nlink) = match attrs.kind {
            FileKind::Directory => (FileType::Directory, 2),
            FileKind::RegularFile => (FileType::RegularFile, 1),
        };
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(BLOCK_SIZE as u64),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: attrs.perm,
            nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    async fn lookup(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent = unwrap!(reply, self.path(parent));
        let path = InodeTable::child_path(&parent, name);
        let attrs = unwrap!(reply, self.fs.attributes(&path).await);
        let ino = self.inodes.lock().lookup(&path);
        reply.entry(&TTL, &self.file_attr(ino, &attrs), 0);
    }

    async fn getattr(&self, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        // an open handle answers with what it captured
        let captured = fh.and_then(|fh| match self.handles.lock().get(&fh) {
            Some(OpenHandle::File(handle)) => Some(handle.attributes()),
            _ => None,
        });
        let attrs = match captured {
            Some(attrs) => attrs,
            None => {
                let path = unwrap!(reply, self.path(ino));
                unwrap!(reply, self.fs.attributes(&path).await)
            }
        };
        reply.attr(&TTL, &self.file_attr(ino, &attrs));
    }

    async fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = unwrap!(reply, self.path(ino));
        let handle = unwrap!(reply, self.fs.open(&path, flags).await);
        let fh = self.allocate_handle(OpenHandle::File(handle));
        reply.opened(fh, FOPEN_DIRECT_IO);
    }

    fn read(&self, fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let data = match self.handles.lock().get(&fh) {
            Some(OpenHandle::File(handle)) => Ok(handle.read(offset.max(0) as u64, size as usize)),
            Some(OpenHandle::Directory(_)) => Err(libc::EISDIR),
            None => Err(libc::EBADF),
        };
        match data {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(&self, fh: u64, reply: ReplyEmpty) {
        match self.handles.lock().remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    async fn opendir(&self, ino: u64, reply: ReplyOpen) {
        let path = unwrap!(reply, self.path(ino));
        let children = unwrap!(reply, self.fs.open_directory(&path).await);
        let entries = self.index_directory(ino, &path, children);

        let fh = self.allocate_handle(OpenHandle::Directory(Arc::new(entries)));
        reply.opened(fh, 0);
    }

    /// Assign inodes to the children of `path`, releasing those of
    /// entries that have disappeared
    fn index_directory(&self, ino: u64, path: &str, children: Vec<DirEntry>) -> Vec<Listed> {
        let mut inodes = self.inodes.lock();
        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(Listed {
            ino,
            kind: FileType::Directory,
            name: ".".to_string(),
        });
        entries.push(Listed {
            ino: inodes.get_or_create(&InodeTable::parent_path(path)),
            kind: FileType::Directory,
            name: "..".to_string(),
        });

        let mut present = HashSet::with_capacity(children.len());
        for child in children {
            let kind = match child.kind {
                FileKind::Directory => FileType::Directory,
                FileKind::RegularFile => FileType::RegularFile,
            };
            let child_path = InodeTable::child_path(path, &child.name);
            entries.push(Listed {
                ino: inodes.get_or_create(&child_path),
                kind,
                name: child.name,
            });
            present.insert(child_path);
        }

        let released = inodes.retain_children(path, &present);
        if released > 0 {
            tracing::debug!(dir = path, released, "released inodes of removed entries");
        }
        entries
    }

    fn readdir(&self, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.handles.lock().get(&fh) {
            Some(OpenHandle::Directory(entries)) => Ok(Arc::clone(entries)),
            Some(OpenHandle::File(_)) => Err(libc::ENOTDIR),
            None => Err(libc::EBADF),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        for (idx, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            // offset of the next entry
            if reply.add(entry.ino, (idx + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn unlink(&self, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent = unwrap!(reply, self.path(parent));
        let path = InodeTable::child_path(&parent, &name.to_string_lossy());
        unwrap!(reply, self.fs.unlink(&path));
        reply.ok();
    }

    fn statfs(&self, reply: ReplyStatfs) {
        let stat = self.fs.statfs();
        reply.statfs(
            stat.blocks,
            stat.bfree,
            stat.bavail,
            stat.files,
            stat.ffree,
            stat.bsize,
            stat.namelen,
            stat.frsize,
        );
    }
}

impl fuser::Filesystem for Session {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(fs = %self.inner.fs, "filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let session = Arc::clone(&self.inner);
        self.runtime
            .spawn(async move { session.lookup(parent, name, reply).await });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if self.inner.inodes.lock().forget(ino, nlookup) {
            tracing::trace!(ino, "inode released");
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let session = Arc::clone(&self.inner);
        self.runtime
            .spawn(async move { session.getattr(ino, fh, reply).await });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let session = Arc::clone(&self.inner);
        self.runtime
            .spawn(async move { session.open(ino, flags, reply).await });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.inner.read(fh, offset, size, reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.inner.release(fh, reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let session = Arc::clone(&self.inner);
        self.runtime
            .spawn(async move { session.opendir(ino, reply).await });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        self.inner.readdir(fh, offset, reply);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.inner.release(fh, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.inner.unlink(parent, name, reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.inner.statfs(reply);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::MemoryBackend;

    use super::*;
    use crate::cache::{SecretCache, SecretCacheConfig};
    use crate::ownership::Ownership;

    fn inner() -> SessionInner {
        let cache = SecretCache::new(
            Arc::new(MemoryBackend::new()),
            SecretCacheConfig::default(),
        );
        SessionInner::new(SecretFs::new(cache, Ownership::new(7, 8), "/mnt"))
    }

    #[test]
    fn test_file_attr() {
        let session = inner();
        let attrs = Attributes::file(0o440, 5000, Ownership::new(7, 8));
        let attr = session.file_attr(42, &attrs);

        assert_eq!(attr.ino, 42);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o440);
        assert_eq!(attr.blocks, 2);
        assert_eq!((attr.uid, attr.gid, attr.nlink), (7, 8, 1));
    }

    #[tokio::test]
    async fn test_directory_read_releases_removed_entries() {
        let backend = MemoryBackend::new();
        backend.insert(&common::Secret::new("kept", "1"));
        backend.insert(&common::Secret::new("gone", "2"));
        let cache = SecretCache::new(Arc::new(backend.clone()), SecretCacheConfig::default());
        cache.refresh().await.unwrap();
        let session = SessionInner::new(SecretFs::new(cache.clone(), Ownership::new(7, 8), "/mnt"));

        let children = session.fs.open_directory("/").await.unwrap();
        let listed = session.index_directory(InodeTable::ROOT_INODE, "/", children);
        let gone = listed.iter().find(|entry| entry.name == "gone").unwrap().ino;
        assert_eq!(session.path(gone).unwrap(), "/gone");

        backend.remove("gone");
        cache.refresh().await.unwrap();
        let children = session.fs.open_directory("/").await.unwrap();
        let listed = session.index_directory(InodeTable::ROOT_INODE, "/", children);

        assert!(listed.iter().all(|entry| entry.name != "gone"));
        assert!(matches!(session.path(gone), Err(FsError::NotFound(_))));
        assert!(session.inodes.lock().get_inode("/kept").is_some());
    }

    #[test]
    fn test_root_path_and_handles() {
        let session = inner();
        assert_eq!(session.path(InodeTable::ROOT_INODE).unwrap(), "/");
        assert!(matches!(session.path(999), Err(FsError::NotFound(_))));

        let a = session.allocate_handle(OpenHandle::Directory(Arc::new(Vec::new())));
        let b = session.allocate_handle(OpenHandle::Directory(Arc::new(Vec::new())));
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
