//! Disk-based image manifest store with LRU eviction.
//!
//! Stores built and pulled manifests on disk with an in-memory index
//! backed by a persistent `index.json`. The store owns manifests only;
//! layer payloads live in the layer cache and are shared across images.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};
use tokio::sync::RwLock;

use crate::manifest::ImageManifest;

/// Index entry for a stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image reference string (e.g., "hello:latest")
    pub reference: String,
    /// Manifest content digest (hex)
    pub digest: String,
    /// Total layer payload size in bytes
    pub size_bytes: u64,
    /// When the image was stored
    pub created_at: DateTime<Utc>,
    /// When the image was last used
    pub last_used: DateTime<Utc>,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based manifest store with in-memory index and LRU eviction.
pub struct ImageStore {
    store_dir: PathBuf,
    /// reference → StoredImage
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
    max_size_bytes: u64,
}

impl ImageStore {
    /// Open a store, creating the directory and loading any existing index.
    pub fn new(store_dir: &Path, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(store_dir.join("manifests")).map_err(|e| {
            StrataError::ImageError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let images = Self::read_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(images)),
            max_size_bytes,
        })
    }

    fn index_path(&self) -> PathBuf {
        self.store_dir.join("index.json")
    }

    fn manifest_path(&self, digest: &str) -> PathBuf {
        self.store_dir.join("manifests").join(format!("{digest}.json"))
    }

    fn read_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
        let path = store_dir.join("index.json");
        let mut images = HashMap::new();
        if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(|e| {
                StrataError::ImageError(format!("Failed to read store index: {e}"))
            })?;
            let parsed: StoreIndex = serde_json::from_str(&data).unwrap_or_default();
            for image in parsed.images {
                images.insert(image.reference.clone(), image);
            }
        }
        Ok(images)
    }

    async fn save_index(&self) -> Result<()> {
        let index = self.index.read().await;
        let snapshot = StoreIndex {
            images: index.values().cloned().collect(),
        };
        drop(index);

        let data = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.index_path().with_extension("json.tmp");
        std::fs::write(&tmp, &data)
            .and_then(|_| std::fs::rename(&tmp, self.index_path()))
            .map_err(|e| StrataError::ImageError(format!("Failed to save store index: {e}")))?;
        Ok(())
    }

    /// Look up an image by reference, refreshing its last-used time.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        let mut index = self.index.write().await;
        let image = index.get_mut(reference)?;
        image.last_used = Utc::now();
        let updated = image.clone();
        drop(index);

        let _ = self.save_index().await;
        Some(updated)
    }

    /// Load the manifest for a stored image.
    pub fn manifest(&self, digest: &str) -> Result<ImageManifest> {
        let path = self.manifest_path(digest);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            StrataError::ImageError(format!(
                "Manifest {} not found in store: {}",
                digest, e
            ))
        })?;
        let manifest: ImageManifest = serde_json::from_str(&data)?;
        Ok(manifest)
    }

    /// Resolve a reference directly to its manifest.
    pub async fn resolve(&self, reference: &str) -> Result<(StoredImage, ImageManifest)> {
        let stored = self.get(reference).await.ok_or_else(|| {
            StrataError::ImageError(format!("Image not found: {reference}"))
        })?;
        let manifest = self.manifest(&stored.digest)?;
        Ok((stored, manifest))
    }

    /// Store a manifest under a reference, evicting LRU images if the
    /// store grows past its budget.
    pub async fn put(&self, reference: &str, manifest: &ImageManifest) -> Result<StoredImage> {
        let digest = manifest.digest()?;
        let path = self.manifest_path(&digest);
        if !path.exists() {
            std::fs::write(&path, serde_json::to_string_pretty(manifest)?).map_err(|e| {
                StrataError::ImageError(format!("Failed to write manifest blob: {e}"))
            })?;
        }

        let now = Utc::now();
        let stored = StoredImage {
            reference: reference.to_string(),
            digest,
            size_bytes: manifest.total_size(),
            created_at: now,
            last_used: now,
        };

        let mut index = self.index.write().await;
        index.insert(reference.to_string(), stored.clone());
        drop(index);

        self.evict_lru().await?;
        self.save_index().await?;
        Ok(stored)
    }

    /// Remove an image by reference. The manifest blob is deleted only
    /// when no other reference shares its digest.
    pub async fn remove(&self, reference: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let Some(image) = index.remove(reference) else {
            return Err(StrataError::ImageError(format!(
                "Image not found: {reference}"
            )));
        };
        let digest_shared = index.values().any(|img| img.digest == image.digest);
        drop(index);

        if !digest_shared {
            let path = self.manifest_path(&image.digest);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    StrataError::ImageError(format!("Failed to remove manifest blob: {e}"))
                })?;
            }
        }

        self.save_index().await
    }

    /// List all stored images.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images
    }

    /// Layer digests referenced by any stored manifest. Feeds the layer
    /// cache's protected set so referenced layers are never pruned.
    pub async fn referenced_layers(&self) -> Result<HashSet<String>> {
        let digests: Vec<String> = {
            let index = self.index.read().await;
            index.values().map(|img| img.digest.clone()).collect()
        };

        let mut layers = HashSet::new();
        for digest in digests {
            if let Ok(manifest) = self.manifest(&digest) {
                for layer in &manifest.layers {
                    layers.insert(layer.digest.clone());
                }
            }
        }
        Ok(layers)
    }

    /// Evict least-recently-used images until the store fits its budget.
    async fn evict_lru(&self) -> Result<()> {
        let mut index = self.index.write().await;
        let mut total: u64 = index.values().map(|img| img.size_bytes).sum();
        if total <= self.max_size_bytes {
            return Ok(());
        }

        let mut by_age: Vec<StoredImage> = index.values().cloned().collect();
        by_age.sort_by_key(|img| img.last_used);

        for image in by_age {
            if total <= self.max_size_bytes {
                break;
            }
            index.remove(&image.reference);
            let digest_shared = index.values().any(|img| img.digest == image.digest);
            if !digest_shared {
                let _ = std::fs::remove_file(self.manifest_path(&image.digest));
            }
            total = total.saturating_sub(image.size_bytes);
            tracing::info!(
                reference = %image.reference,
                size_bytes = image.size_bytes,
                "Evicted image from store"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::LayerRef;
    use tempfile::TempDir;

    fn manifest_with_layers(layers: &[(&str, u64)]) -> ImageManifest {
        ImageManifest {
            schema_version: ImageManifest::SCHEMA_VERSION,
            layers: layers
                .iter()
                .map(|(d, s)| LayerRef {
                    digest: d.to_string(),
                    size: *s,
                })
                .collect(),
            entrypoint: Some(vec!["/app/server".to_string()]),
            cmd: None,
            env: vec![],
            user: None,
            workdir: "/".to_string(),
            exposed_ports: vec![],
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_put_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
        let manifest = manifest_with_layers(&[("l1", 100)]);

        let stored = store.put("hello:latest", &manifest).await.unwrap();
        assert_eq!(stored.size_bytes, 100);

        let (found, loaded) = store.resolve("hello:latest").await.unwrap();
        assert_eq!(found.digest, stored.digest);
        assert_eq!(loaded.digest().unwrap(), manifest.digest().unwrap());
    }

    #[tokio::test]
    async fn test_store_get_missing() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
        assert!(store.get("nope:latest").await.is_none());
        assert!(store.resolve("nope:latest").await.is_err());
    }

    #[tokio::test]
    async fn test_store_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let manifest = manifest_with_layers(&[("l1", 10)]);
        {
            let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
            store.put("persist:latest", &manifest).await.unwrap();
        }

        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
        let (_, loaded) = store.resolve("persist:latest").await.unwrap();
        assert_eq!(loaded.digest().unwrap(), manifest.digest().unwrap());
    }

    #[tokio::test]
    async fn test_store_remove() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
        let manifest = manifest_with_layers(&[("l1", 10)]);

        let stored = store.put("gone:latest", &manifest).await.unwrap();
        store.remove("gone:latest").await.unwrap();

        assert!(store.get("gone:latest").await.is_none());
        assert!(store.manifest(&stored.digest).is_err());
    }

    #[tokio::test]
    async fn test_store_remove_keeps_shared_manifest() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
        let manifest = manifest_with_layers(&[("l1", 10)]);

        store.put("a:latest", &manifest).await.unwrap();
        let stored = store.put("b:latest", &manifest).await.unwrap();

        store.remove("a:latest").await.unwrap();
        // b still resolves through the shared manifest blob
        assert!(store.manifest(&stored.digest).is_ok());
    }

    #[tokio::test]
    async fn test_store_remove_missing_errors() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();
        assert!(store.remove("absent:latest").await.is_err());
    }

    #[tokio::test]
    async fn test_store_eviction_by_budget() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), 150).unwrap();

        store
            .put("old:latest", &manifest_with_layers(&[("l1", 100)]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store
            .put("new:latest", &manifest_with_layers(&[("l2", 100)]))
            .await
            .unwrap();

        // 200 bytes > 150 budget: the older image is evicted
        assert!(store.get("old:latest").await.is_none());
        assert!(store.get("new:latest").await.is_some());
    }

    #[tokio::test]
    async fn test_store_referenced_layers() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();

        store
            .put("a:latest", &manifest_with_layers(&[("base", 10), ("app", 20)]))
            .await
            .unwrap();
        store
            .put("b:latest", &manifest_with_layers(&[("base", 10), ("other", 5)]))
            .await
            .unwrap();

        let layers = store.referenced_layers().await.unwrap();
        assert_eq!(layers.len(), 3);
        assert!(layers.contains("base"));
        assert!(layers.contains("app"));
        assert!(layers.contains("other"));
    }

    #[tokio::test]
    async fn test_store_list_sorted_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), u64::MAX).unwrap();

        store
            .put("first:latest", &manifest_with_layers(&[("l1", 1)]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store
            .put("second:latest", &manifest_with_layers(&[("l2", 1)]))
            .await
            .unwrap();

        let list = store.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].reference, "second:latest");
    }
}
