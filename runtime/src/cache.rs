//! Content-addressed layer cache.
//!
//! Each layer payload is stored by its chained content digest, so
//! identical build steps share one on-disk copy. A per-digest advisory
//! flock serializes concurrent builds of the same step: the loser blocks
//! until the winner commits, then finds the entry already cached.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};

/// Sidecar metadata for a cached layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMeta {
    /// Chained content digest (hex)
    pub digest: String,
    /// Parent layer digest, if any
    pub parent: Option<String>,
    /// Payload size in bytes
    pub size_bytes: u64,
    /// When this layer was cached (Unix timestamp)
    pub created_at: i64,
    /// Last time this layer was used (Unix timestamp)
    pub last_used: i64,
}

/// A cache entry: payload path plus metadata.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub path: PathBuf,
    pub meta: LayerMeta,
}

/// Content-addressed cache of layer payloads.
pub struct LayerCache {
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Open (creating if needed) a cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    fn payload_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(format!("{digest}.tar.gz"))
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(format!("{digest}.meta.json"))
    }

    fn lock_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(format!("{digest}.lock"))
    }

    /// Look up a layer by digest, updating its last-used timestamp.
    pub fn get(&self, digest: &str) -> Result<Option<CachedLayer>> {
        let payload = self.payload_path(digest);
        let meta_path = self.meta_path(digest);
        if !payload.is_file() || !meta_path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&meta_path).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to read layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;
        let mut meta: LayerMeta = serde_json::from_str(&content)
            .map_err(|e| StrataError::CacheError(format!("Corrupt layer metadata: {e}")))?;

        meta.last_used = chrono::Utc::now().timestamp();
        // Best-effort timestamp refresh
        let _ = std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?);

        Ok(Some(CachedLayer {
            path: payload,
            meta,
        }))
    }

    /// Store a layer payload under `digest`, copying it into the cache.
    pub fn put(&self, digest: &str, parent: Option<&str>, payload: &Path) -> Result<CachedLayer> {
        let target = self.payload_path(digest);
        std::fs::copy(payload, &target).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to copy layer {} into cache: {}",
                payload.display(),
                e
            ))
        })?;

        let size_bytes = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        let now = chrono::Utc::now().timestamp();
        let meta = LayerMeta {
            digest: digest.to_string(),
            parent: parent.map(|p| p.to_string()),
            size_bytes,
            created_at: now,
            last_used: now,
        };
        let meta_path = self.meta_path(digest);
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to write layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;

        tracing::debug!(digest = %digest, size_bytes, "Cached layer");

        Ok(CachedLayer { path: target, meta })
    }

    /// Remove a cached layer by digest.
    pub fn invalidate(&self, digest: &str) -> Result<()> {
        for path in [
            self.payload_path(digest),
            self.meta_path(digest),
            self.lock_path(digest),
        ] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    StrataError::CacheError(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Take the advisory lock for a digest, blocking until it is free.
    ///
    /// Serializes concurrent execution of the same build step across
    /// processes sharing this cache. Callers re-check `get` after the lock
    /// is acquired, since the previous holder may have committed the layer.
    pub fn lock(&self, digest: &str) -> Result<CacheLock> {
        CacheLock::acquire(&self.lock_path(digest))
    }

    /// List all cached layer metadata entries.
    pub fn list(&self) -> Result<Vec<LayerMeta>> {
        let mut entries = Vec::new();
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        for entry in read_dir {
            let entry = entry
                .map_err(|e| StrataError::CacheError(format!("Failed to read cache entry: {e}")))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".meta.json") {
                continue;
            }
            // Skip unreadable or corrupt sidecars
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(meta) = serde_json::from_str::<LayerMeta>(&content) {
                    entries.push(meta);
                }
            }
        }

        Ok(entries)
    }

    /// Total payload bytes across all cached layers.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|e| e.size_bytes).sum())
    }

    /// Evict least-recently-used layers until the cache fits `max_bytes`.
    ///
    /// Digests in `protected` (layers referenced by stored manifests) are
    /// never evicted. Returns the number of entries removed.
    pub fn prune(&self, max_bytes: u64, protected: &HashSet<String>) -> Result<usize> {
        let mut entries = self.list()?;
        let mut current: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if current <= max_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.last_used);

        let mut evicted = 0;
        for entry in &entries {
            if current <= max_bytes {
                break;
            }
            if protected.contains(&entry.digest) {
                continue;
            }
            self.invalidate(&entry.digest)?;
            current = current.saturating_sub(entry.size_bytes);
            evicted += 1;
            tracing::debug!(digest = %entry.digest, size_bytes = entry.size_bytes, "Evicted cached layer");
        }

        Ok(evicted)
    }
}

/// Advisory per-digest lock, released on drop (or process exit).
#[derive(Debug)]
pub struct CacheLock {
    #[allow(dead_code)] // Held for lifetime, not directly accessed
    file: File,
}

impl CacheLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                StrataError::CacheError(format!(
                    "Failed to open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result != 0 {
                return Err(StrataError::CacheError(format!(
                    "Failed to acquire lock {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
        }

        Ok(CacheLock { file })
    }
}
