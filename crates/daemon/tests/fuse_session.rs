//! FUSE session construction and inode bookkeeping.
//!
//! Mounting needs privileges, so these tests stop short of the kernel.

#![cfg(feature = "fuse")]

mod support;

use secretfs_daemon::fuse::{InodeTable, Session};

#[tokio::test]
async fn test_session_builds_on_current_runtime() {
    let (fs, _) = support::setup().await;
    let _session = Session::new(fs, tokio::runtime::Handle::current());
}

#[tokio::test]
async fn test_mount_rejects_missing_mountpoint() {
    let (fs, _) = support::setup().await;
    let dir = tempfile::tempdir().unwrap();

    let result = secretfs_daemon::fuse::mount(fs, &dir.path().join("missing"), false);
    assert!(result.is_err());
}

#[test]
fn test_inode_paths_match_engine_paths() {
    let mut table = InodeTable::new();
    let json = table.get_or_create(&InodeTable::child_path("/", ".json"));
    let secret_dir = table.get_or_create(&InodeTable::child_path("/.json", "secret"));

    assert_eq!(table.get_path(json), Some("/.json"));
    assert_eq!(
        table.get_inode(&InodeTable::parent_path("/.json/secret")),
        Some(json)
    );
    assert_ne!(json, secret_dir);
}
