//! Numeric ownership for filesystem entries
//!
//! Secrets name their owner and group by account name. The kernel wants
//! ids, so names are resolved through the system user database and the
//! results memoized.

use std::time::Duration;

use moka::sync::Cache;
use nix::unistd::{getgid, getuid, Group, User};
use serde::Serialize;

use common::Secret;

use crate::config::ConfigError;

const IDENTITY_CACHE_CAPACITY: u64 = 1024;
const IDENTITY_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Ownership of the running process
    pub fn current() -> Self {
        Self {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }

    /// Resolve optional user and group names, falling back to the running
    /// process' ids for whichever is absent
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self, ConfigError> {
        let current = Self::current();
        let uid = match user {
            Some(user) => lookup_uid(user).ok_or_else(|| ConfigError::UnknownUser(user.into()))?,
            None => current.uid,
        };
        let gid = match group {
            Some(group) => {
                lookup_gid(group).ok_or_else(|| ConfigError::UnknownGroup(group.into()))?
            }
            None => current.gid,
        };
        Ok(Self { uid, gid })
    }
}

/// Numeric ids are taken as-is, anything else goes through the passwd database
pub fn lookup_uid(name: &str) -> Option<u32> {
    if let Ok(uid) = name.parse() {
        return Some(uid);
    }
    match User::from_name(name) {
        Ok(user) => user.map(|u| u.uid.as_raw()),
        Err(err) => {
            tracing::warn!(user = name, "user lookup failed: {err}");
            None
        }
    }
}

pub fn lookup_gid(name: &str) -> Option<u32> {
    if let Ok(gid) = name.parse() {
        return Some(gid);
    }
    match Group::from_name(name) {
        Ok(group) => group.map(|g| g.gid.as_raw()),
        Err(err) => {
            tracing::warn!(group = name, "group lookup failed: {err}");
            None
        }
    }
}

/// Memoized name to id lookups for per-secret ownership
#[derive(Clone)]
pub struct IdentityCache {
    users: Cache<String, Option<u32>>,
    groups: Cache<String, Option<u32>>,
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("users", &self.users.entry_count())
            .field("groups", &self.groups.entry_count())
            .finish()
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityCache {
    pub fn new() -> Self {
        let build = || {
            Cache::builder()
                .max_capacity(IDENTITY_CACHE_CAPACITY)
                .time_to_live(IDENTITY_CACHE_TTL)
                .build()
        };
        Self {
            users: build(),
            groups: build(),
        }
    }

    /// Ownership for a secret's entry. Owner or group names that cannot be
    /// resolved fall back to the mount default.
    pub fn ownership_for(&self, secret: &Secret, default: Ownership) -> Ownership {
        let uid = secret
            .owner()
            .and_then(|owner| self.uid(owner))
            .unwrap_or(default.uid);
        let gid = secret
            .group()
            .and_then(|group| self.gid(group))
            .unwrap_or(default.gid);
        Ownership { uid, gid }
    }

    fn uid(&self, name: &str) -> Option<u32> {
        self.users
            .get_with(name.to_string(), || lookup_uid(name))
    }

    fn gid(&self, name: &str) -> Option<u32> {
        self.groups
            .get_with(name.to_string(), || lookup_gid(name))
    }
}
