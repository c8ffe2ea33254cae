//! Build and version information

use serde::{Deserialize, Serialize};

/// Crate version, shown verbatim in the `.version` control file
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Information about the running build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    /// Comma separated cargo features the binary was built with
    pub build_features: String,
    /// When the binary was built, if recorded
    pub build_timestamp: Option<String>,
    pub build_profile: String,
}

impl BuildInfo {
    pub fn new() -> Self {
        Self {
            version: VERSION.to_string(),
            build_features: option_env!("BUILD_FEATURES").unwrap_or("none").to_string(),
            build_timestamp: option_env!("BUILD_TIMESTAMP").map(str::to_string),
            build_profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            }
            .to_string(),
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.build_features.split(',').any(|f| f.trim() == feature)
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.version)
    }
}
