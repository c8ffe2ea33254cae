//! Path classification
//!
//! Every path the kernel hands us maps to exactly one [`VirtualNode`].
//! Routing is pure: it only consults the current name table to turn
//! entry names back into raw secret names.

use common::NameTable;

/// Files with fixed names and rendered content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlFile {
    /// `.version`
    Version,
    /// `.running`
    Running,
    /// `.clear_cache`, unlinked to flush the cache
    ClearCache,
    /// `.json/status`
    Status,
    /// `.json/metrics`
    Metrics,
    /// `.json/server_status`
    ServerStatus,
}

impl ControlFile {
    /// Control files living at the root
    pub const ROOT: [ControlFile; 3] = [Self::Version, Self::Running, Self::ClearCache];
    /// Control files living under `.json`
    pub const JSON: [ControlFile; 3] = [Self::Metrics, Self::Status, Self::ServerStatus];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Version => ".version",
            Self::Running => ".running",
            Self::ClearCache => ".clear_cache",
            Self::Status => "status",
            Self::Metrics => "metrics",
            Self::ServerStatus => "server_status",
        }
    }

    fn root(segment: &str) -> Option<Self> {
        Self::ROOT.into_iter().find(|c| c.name() == segment)
    }

    fn json(segment: &str) -> Option<Self> {
        Self::JSON.into_iter().find(|c| c.name() == segment)
    }
}

pub const JSON_DIR: &str = ".json";
pub const PROFILING_DIR: &str = ".pprof";
pub const JSON_SECRET_DIR: &str = "secret";
pub const JSON_SECRETS_FILE: &str = "secrets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualNode {
    Root,
    /// `.json`
    JsonDir,
    /// `.json/secret`
    JsonSecretDir,
    /// `.pprof`, present but always empty
    ProfilingDir,
    /// Decoded secret content at the root
    SecretFile { name: String },
    /// Raw backend payload of one secret
    JsonSecretFile { name: String },
    /// Raw backend listing
    JsonSecretsFile,
    Control(ControlFile),
    NotFound,
}

impl VirtualNode {
    pub fn is_dir(&self) -> bool {
        matches!(
            self,
            Self::Root | Self::JsonDir | Self::JsonSecretDir | Self::ProfilingDir
        )
    }
}

/// Classify `path`, relative to the mount root
pub fn route(path: &str, names: &NameTable) -> VirtualNode {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [] => VirtualNode::Root,
        [JSON_DIR, rest @ ..] => route_json(rest, names),
        [PROFILING_DIR] => VirtualNode::ProfilingDir,
        [single] => match ControlFile::root(single) {
            Some(control) => VirtualNode::Control(control),
            None if is_dot_entry(single) => VirtualNode::NotFound,
            None => VirtualNode::SecretFile {
                name: names.raw_name(single).to_string(),
            },
        },
        _ => VirtualNode::NotFound,
    }
}

fn route_json(rest: &[&str], names: &NameTable) -> VirtualNode {
    match rest {
        [] => VirtualNode::JsonDir,
        [JSON_SECRETS_FILE] => VirtualNode::JsonSecretsFile,
        [JSON_SECRET_DIR] => VirtualNode::JsonSecretDir,
        [JSON_SECRET_DIR, entry] if !is_dot_entry(entry) => VirtualNode::JsonSecretFile {
            name: names.raw_name(entry).to_string(),
        },
        [leaf] => ControlFile::json(leaf).map_or(VirtualNode::NotFound, VirtualNode::Control),
        _ => VirtualNode::NotFound,
    }
}

fn is_dot_entry(segment: &str) -> bool {
    segment == "." || segment == ".."
}
