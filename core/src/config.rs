//! Strata configuration: home directory layout and storage budgets.
//!
//! All on-disk state lives under a single home directory (`~/.strata` by
//! default, overridable via `STRATA_HOME`): the layer cache, the image
//! store, per-container rootfs directories, and the container state file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default maximum image store size: 10 GB.
pub const DEFAULT_IMAGE_STORE_LIMIT: u64 = 10 * 1024 * 1024 * 1024;

/// Default maximum layer cache size: 20 GB.
pub const DEFAULT_LAYER_CACHE_LIMIT: u64 = 20 * 1024 * 1024 * 1024;

/// Strata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Home directory for all strata state
    pub home: PathBuf,

    /// Maximum total size of the image store in bytes
    pub image_store_limit: u64,

    /// Maximum total size of the layer cache in bytes
    pub layer_cache_limit: u64,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            image_store_limit: DEFAULT_IMAGE_STORE_LIMIT,
            layer_cache_limit: DEFAULT_LAYER_CACHE_LIMIT,
        }
    }
}

impl StrataConfig {
    /// Directory holding cached layer payloads (`<home>/cache/layers`).
    pub fn layer_cache_dir(&self) -> PathBuf {
        self.home.join("cache").join("layers")
    }

    /// Directory holding stored image manifests (`<home>/images`).
    pub fn image_store_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    /// Directory holding per-container rootfs trees (`<home>/containers`).
    pub fn containers_dir(&self) -> PathBuf {
        self.home.join("containers")
    }

    /// Path to the container state file (`<home>/containers.json`).
    pub fn state_file(&self) -> PathBuf {
        self.home.join("containers.json")
    }
}

/// Resolve the home directory: `STRATA_HOME` env var, then `~/.strata`,
/// falling back to `./.strata` when no home directory is known.
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("STRATA_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}
