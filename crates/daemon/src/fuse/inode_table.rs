//! Bidirectional inode ↔ path mapping
//!
//! FUSE addresses entries by 64-bit inode numbers while the filesystem
//! engine works on paths. Inodes are handed out on first use and stay
//! stable while the kernel references them, so a secret keeps its inode
//! across cache refreshes. Once the kernel forgets an inode, or a
//! directory read shows its entry is gone, the mapping is released.

use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    /// Kernel lookup count per inode
    lookups: HashMap<u64, u64>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            lookups: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, "/".to_string());
        table
    }

    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = Self::normalize_path(path);
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(normalized.clone(), inode);
        self.inode_to_path.insert(inode, normalized);
        inode
    }

    /// Inode for `path`, counting one kernel lookup against it
    pub fn lookup(&mut self, path: &str) -> u64 {
        let inode = self.get_or_create(path);
        *self.lookups.entry(inode).or_default() += 1;
        inode
    }

    /// Drop `nlookup` kernel references to `inode`, releasing it at zero.
    ///
    /// Returns whether the inode was released. The root is never released.
    pub fn forget(&mut self, inode: u64, nlookup: u64) -> bool {
        if inode == Self::ROOT_INODE {
            return false;
        }
        let remaining = match self.lookups.get_mut(&inode) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return false;
        }
        self.remove(inode)
    }

    /// Release unreferenced children of `dir` that are not in `present`.
    ///
    /// Returns the number of inodes released.
    pub fn retain_children(&mut self, dir: &str, present: &HashSet<String>) -> usize {
        let dir = Self::normalize_path(dir);
        let gone: Vec<u64> = self
            .inode_to_path
            .iter()
            .filter(|(inode, path)| {
                **inode != Self::ROOT_INODE
                    && Self::parent_path(path) == dir
                    && !present.contains(path.as_str())
                    && self.lookups.get(*inode).copied().unwrap_or(0) == 0
            })
            .map(|(inode, _)| *inode)
            .collect();

        gone.into_iter().filter(|inode| self.remove(*inode)).count()
    }

    fn remove(&mut self, inode: u64) -> bool {
        self.lookups.remove(&inode);
        match self.inode_to_path.remove(&inode) {
            Some(path) => {
                self.path_to_inode.remove(&path);
                true
            }
            None => false,
        }
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&Self::normalize_path(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }

    /// Leading slash, no trailing slash, `/` for the root
    pub fn normalize_path(path: &str) -> String {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    pub fn parent_path(path: &str) -> String {
        let normalized = Self::normalize_path(path);
        match normalized.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => normalized[..pos].to_string(),
        }
    }

    /// Path of entry `name` inside directory `parent`
    pub fn child_path(parent: &str, name: &str) -> String {
        let parent = Self::normalize_path(parent);
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode() {
        let table = InodeTable::new();
        assert_eq!(table.get_inode(""), Some(InodeTable::ROOT_INODE));
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some("/"));
    }

    #[test]
    fn test_inodes_are_stable() {
        let mut table = InodeTable::new();

        let secret = table.get_or_create("/hmac.key");
        let again = table.get_or_create("hmac.key/");
        let status = table.get_or_create("/.json/status");

        assert_eq!(secret, again);
        assert_ne!(secret, status);
        assert_ne!(secret, InodeTable::ROOT_INODE);
        assert_eq!(table.get_path(status), Some("/.json/status"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_forget_releases_at_zero() {
        let mut table = InodeTable::new();

        let inode = table.lookup("/hmac.key");
        assert_eq!(table.lookup("/hmac.key"), inode);

        assert!(!table.forget(inode, 1));
        assert_eq!(table.get_path(inode), Some("/hmac.key"));
        assert!(table.forget(inode, 1));
        assert_eq!(table.get_path(inode), None);
        assert_eq!(table.get_inode("/hmac.key"), None);

        // a later lookup gets a fresh inode
        assert_ne!(table.lookup("/hmac.key"), inode);
        assert!(!table.forget(InodeTable::ROOT_INODE, 10));
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some("/"));
    }

    #[test]
    fn test_retain_children_drops_unreferenced_entries() {
        let mut table = InodeTable::new();
        let kept = table.get_or_create("/kept");
        let gone = table.get_or_create("/gone");
        let held = table.lookup("/held");
        let nested = table.get_or_create("/.json/secret/gone");

        let present: HashSet<String> = ["/kept".to_string()].into_iter().collect();
        assert_eq!(table.retain_children("/", &present), 1);

        assert_eq!(table.get_path(kept), Some("/kept"));
        assert_eq!(table.get_path(gone), None);
        // still referenced by the kernel
        assert_eq!(table.get_path(held), Some("/held"));
        // other directories are untouched
        assert_eq!(table.get_path(nested), Some("/.json/secret/gone"));
    }

    #[test]
    fn test_paths() {
        assert_eq!(InodeTable::normalize_path("/.json/"), "/.json");
        assert_eq!(InodeTable::parent_path("/.json/secret/a"), "/.json/secret");
        assert_eq!(InodeTable::parent_path("/.version"), "/");
        assert_eq!(InodeTable::parent_path("/"), "/");
        assert_eq!(InodeTable::child_path("/", ".json"), "/.json");
        assert_eq!(InodeTable::child_path("/.json", "secret"), "/.json/secret");
    }
}
