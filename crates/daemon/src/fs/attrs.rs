//! Attribute synthesis
//!
//! Permissions are a fixed function of the node kind. Raw payloads and
//! pseudo-directories stay private to the mount owner; decoded secrets
//! without an individual owner are group readable.

use super::router::{ControlFile, VirtualNode};
use crate::ownership::Ownership;

/// Size reported for every directory
pub const DIRECTORY_SIZE: u64 = 4096;

pub const ROOT_MODE: u16 = 0o755;
pub const PRIVATE_DIR_MODE: u16 = 0o700;
pub const PUBLIC_FILE_MODE: u16 = 0o444;
pub const CLEAR_CACHE_MODE: u16 = 0o440;
pub const RAW_PAYLOAD_MODE: u16 = 0o400;
pub const SHARED_SECRET_MODE: u16 = 0o440;
pub const OWNED_SECRET_MODE: u16 = 0o400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub kind: FileKind,
    /// Permission bits only, without the file type
    pub perm: u16,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

impl Attributes {
    pub fn directory(perm: u16, owner: Ownership) -> Self {
        Self {
            kind: FileKind::Directory,
            perm,
            size: DIRECTORY_SIZE,
            uid: owner.uid,
            gid: owner.gid,
        }
    }

    pub fn file(perm: u16, size: u64, owner: Ownership) -> Self {
        Self {
            kind: FileKind::RegularFile,
            perm,
            size,
            uid: owner.uid,
            gid: owner.gid,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Full `st_mode`, file type included
    pub fn mode(&self) -> u32 {
        let format = match self.kind {
            FileKind::Directory => libc::S_IFDIR,
            FileKind::RegularFile => libc::S_IFREG,
        };
        format as u32 | u32::from(self.perm)
    }
}

/// Attributes of `node`.
///
/// `size` is the length of the node's content and is ignored for
/// directories. `secret_owner` is the resolved owner of an individually
/// owned secret. Returns `None` for [`VirtualNode::NotFound`].
pub fn attributes_for(
    node: &VirtualNode,
    size: u64,
    secret_owner: Option<Ownership>,
    mount: Ownership,
) -> Option<Attributes> {
    let attributes = match node {
        VirtualNode::Root => Attributes::directory(ROOT_MODE, mount),
        VirtualNode::JsonDir | VirtualNode::JsonSecretDir | VirtualNode::ProfilingDir => {
            Attributes::directory(PRIVATE_DIR_MODE, mount)
        }
        VirtualNode::Control(ControlFile::ClearCache) => {
            Attributes::file(CLEAR_CACHE_MODE, 0, mount)
        }
        VirtualNode::Control(_) => Attributes::file(PUBLIC_FILE_MODE, size, mount),
        VirtualNode::JsonSecretsFile | VirtualNode::JsonSecretFile { .. } => {
            Attributes::file(RAW_PAYLOAD_MODE, size, mount)
        }
        VirtualNode::SecretFile { .. } => match secret_owner {
            Some(owner) => Attributes::file(OWNED_SECRET_MODE, size, owner),
            None => Attributes::file(SHARED_SECRET_MODE, size, mount),
        },
        VirtualNode::NotFound => return None,
    };
    Some(attributes)
}
