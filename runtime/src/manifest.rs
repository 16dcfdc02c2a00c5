//! Image manifest: the ordered layer stack plus run metadata.
//!
//! A manifest is produced only by a completed build, is immutable, and is
//! referenced (never copied) by the runner and the registry. Its digest is
//! computed over a canonical view that excludes the creation timestamp, so
//! rebuilding identical inputs yields an identical digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::error::Result;

/// Reference to one immutable layer in the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRef {
    /// Chained content digest (hex), the layer cache key
    pub digest: String,
    /// Payload size in bytes
    pub size: u64,
}

/// A complete, runnable image description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Manifest schema version
    pub schema_version: u32,
    /// Ordered layer references, bottom to top
    pub layers: Vec<LayerRef>,
    /// Entrypoint argv
    pub entrypoint: Option<Vec<String>>,
    /// Default command argv (appended to the entrypoint)
    pub cmd: Option<Vec<String>>,
    /// Environment variables
    pub env: Vec<(String, String)>,
    /// Default user for the entrypoint process
    pub user: Option<String>,
    /// Working directory for the entrypoint process
    pub workdir: String,
    /// Declared ports; metadata only, never bound on the host
    pub exposed_ports: Vec<u16>,
    /// Build completion time
    pub created: DateTime<Utc>,
}

/// Canonical view hashed to produce the manifest digest. The creation
/// timestamp is deliberately absent.
#[derive(Serialize)]
struct DigestView<'a> {
    schema_version: u32,
    layers: &'a [LayerRef],
    entrypoint: &'a Option<Vec<String>>,
    cmd: &'a Option<Vec<String>>,
    env: &'a [(String, String)],
    user: &'a Option<String>,
    workdir: &'a str,
    exposed_ports: &'a [u16],
}

impl ImageManifest {
    pub const SCHEMA_VERSION: u32 = 1;

    /// Content digest of the manifest (hex sha256 of the canonical view).
    pub fn digest(&self) -> Result<String> {
        let view = DigestView {
            schema_version: self.schema_version,
            layers: &self.layers,
            entrypoint: &self.entrypoint,
            cmd: &self.cmd,
            env: &self.env,
            user: &self.user,
            workdir: &self.workdir,
            exposed_ports: &self.exposed_ports,
        };
        let bytes = serde_json::to_vec(&view)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// The full argv the runner executes: entrypoint followed by cmd.
    ///
    /// Returns `None` when the image declares neither.
    pub fn argv(&self) -> Option<Vec<String>> {
        let mut argv = Vec::new();
        if let Some(ep) = &self.entrypoint {
            argv.extend(ep.iter().cloned());
        }
        if let Some(cmd) = &self.cmd {
            argv.extend(cmd.iter().cloned());
        }
        if argv.is_empty() {
            None
        } else {
            Some(argv)
        }
    }

    /// Total payload size across all layers.
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}
