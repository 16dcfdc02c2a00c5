//! Registry endpoint client: push and pull of manifests and layer blobs.
//!
//! The registry is an external collaborator that stores manifests by tag
//! and layer blobs by digest; it never mutates either. `HttpRegistry`
//! talks to a remote endpoint over HTTP, `DirRegistry` to a local
//! directory (air-gapped transfer, tests). Authentication beyond basic
//! credentials is out of scope.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use strata_core::error::{Result, StrataError};

use crate::cache::LayerCache;
use crate::manifest::ImageManifest;

/// Authentication credentials for a registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD` from the
    /// environment, falling back to anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }
}

/// A push/pull endpoint for manifests and layer blobs.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Upload a manifest under `tag`, along with every layer blob it
    /// references. Returns the manifest digest.
    async fn push(&self, manifest: &ImageManifest, tag: &str, layers: &LayerCache)
        -> Result<String>;

    /// Fetch the manifest stored under `tag`, downloading any layer blobs
    /// missing from the local cache.
    async fn pull(&self, tag: &str, layers: &LayerCache) -> Result<ImageManifest>;
}

// ---------------------------------------------------------------------------
// Directory-backed registry
// ---------------------------------------------------------------------------

/// Filesystem-backed registry endpoint.
///
/// Layout: `<root>/manifests/<tag>.json` and `<root>/blobs/<digest>.tar.gz`.
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    pub fn new(root: &Path) -> Result<Self> {
        for sub in ["manifests", "blobs"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| registry_error(
                &root.display().to_string(),
                format!("failed to create registry directory: {e}"),
            ))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn name(&self) -> String {
        self.root.display().to_string()
    }

    fn manifest_path(&self, tag: &str) -> PathBuf {
        self.root
            .join("manifests")
            .join(format!("{}.json", sanitize_tag(tag)))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(format!("{digest}.tar.gz"))
    }
}

#[async_trait]
impl Registry for DirRegistry {
    async fn push(
        &self,
        manifest: &ImageManifest,
        tag: &str,
        layers: &LayerCache,
    ) -> Result<String> {
        for layer in &manifest.layers {
            let cached = layers.get(&layer.digest)?.ok_or_else(|| {
                registry_error(
                    &self.name(),
                    format!("layer {} not in local cache, cannot push", layer.digest),
                )
            })?;

            let blob = self.blob_path(&layer.digest);
            if !blob.exists() {
                std::fs::copy(&cached.path, &blob).map_err(|e| {
                    registry_error(&self.name(), format!("failed to store blob: {e}"))
                })?;
            }
        }

        let data = serde_json::to_string_pretty(manifest)?;
        std::fs::write(self.manifest_path(tag), data).map_err(|e| {
            registry_error(&self.name(), format!("failed to store manifest: {e}"))
        })?;

        let digest = manifest.digest()?;
        tracing::info!(tag = %tag, digest = %digest, "Pushed image");
        Ok(digest)
    }

    async fn pull(&self, tag: &str, layers: &LayerCache) -> Result<ImageManifest> {
        let path = self.manifest_path(tag);
        let data = std::fs::read_to_string(&path).map_err(|_| {
            registry_error(&self.name(), format!("tag '{tag}' not found"))
        })?;
        let manifest: ImageManifest = serde_json::from_str(&data)?;

        let mut parent: Option<String> = None;
        for layer in &manifest.layers {
            if layers.get(&layer.digest)?.is_none() {
                let blob = self.blob_path(&layer.digest);
                if !blob.exists() {
                    return Err(registry_error(
                        &self.name(),
                        format!("blob {} missing for tag '{tag}'", layer.digest),
                    ));
                }
                layers.put(&layer.digest, parent.as_deref(), &blob)?;
            }
            parent = Some(layer.digest.clone());
        }

        tracing::info!(tag = %tag, layers = manifest.layers.len(), "Pulled image");
        Ok(manifest)
    }
}

// ---------------------------------------------------------------------------
// HTTP registry
// ---------------------------------------------------------------------------

/// HTTP registry endpoint.
///
/// Convention: `PUT`/`GET` `{base}/manifests/{tag}` for manifest JSON and
/// `{base}/blobs/{digest}` for layer payloads. Transport details beyond
/// this are the endpoint's business.
pub struct HttpRegistry {
    base_url: String,
    auth: RegistryAuth,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_auth(base_url, RegistryAuth::from_env())
    }

    pub fn with_auth(base_url: impl Into<String>, auth: RegistryAuth) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            auth,
            client: reqwest::Client::new(),
        }
    }

    fn manifest_url(&self, tag: &str) -> String {
        format!("{}/manifests/{}", self.base_url, sanitize_tag(tag))
    }

    fn blob_url(&self, digest: &str) -> String {
        format!("{}/blobs/{}", self.base_url, digest)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.auth.is_anonymous() {
            req
        } else {
            req.basic_auth(
                self.auth.username.clone().unwrap_or_default(),
                self.auth.password.clone(),
            )
        }
    }

    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let resp = self
            .authorize(self.client.head(self.blob_url(digest)))
            .send()
            .await
            .map_err(|e| registry_error(&self.base_url, e.to_string()))?;
        Ok(resp.status().is_success())
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn push(
        &self,
        manifest: &ImageManifest,
        tag: &str,
        layers: &LayerCache,
    ) -> Result<String> {
        for layer in &manifest.layers {
            let cached = layers.get(&layer.digest)?.ok_or_else(|| {
                registry_error(
                    &self.base_url,
                    format!("layer {} not in local cache, cannot push", layer.digest),
                )
            })?;

            if self.blob_exists(&layer.digest).await? {
                tracing::debug!(digest = %layer.digest, "Blob already on registry");
                continue;
            }

            let bytes = std::fs::read(&cached.path).map_err(|e| {
                registry_error(&self.base_url, format!("failed to read blob: {e}"))
            })?;
            let resp = self
                .authorize(self.client.put(self.blob_url(&layer.digest)).body(bytes))
                .send()
                .await
                .map_err(|e| registry_error(&self.base_url, e.to_string()))?;
            if !resp.status().is_success() {
                return Err(registry_error(
                    &self.base_url,
                    format!("blob upload rejected: {}", resp.status()),
                ));
            }
        }

        let resp = self
            .authorize(
                self.client
                    .put(self.manifest_url(tag))
                    .json(manifest),
            )
            .send()
            .await
            .map_err(|e| registry_error(&self.base_url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(registry_error(
                &self.base_url,
                format!("manifest upload rejected: {}", resp.status()),
            ));
        }

        let digest = manifest.digest()?;
        tracing::info!(tag = %tag, digest = %digest, registry = %self.base_url, "Pushed image");
        Ok(digest)
    }

    async fn pull(&self, tag: &str, layers: &LayerCache) -> Result<ImageManifest> {
        let resp = self
            .authorize(self.client.get(self.manifest_url(tag)))
            .send()
            .await
            .map_err(|e| registry_error(&self.base_url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(registry_error(
                &self.base_url,
                format!("tag '{tag}' not found: {}", resp.status()),
            ));
        }
        let manifest: ImageManifest = resp
            .json()
            .await
            .map_err(|e| registry_error(&self.base_url, format!("invalid manifest: {e}")))?;

        let mut parent: Option<String> = None;
        for layer in &manifest.layers {
            if layers.get(&layer.digest)?.is_none() {
                let resp = self
                    .authorize(self.client.get(self.blob_url(&layer.digest)))
                    .send()
                    .await
                    .map_err(|e| registry_error(&self.base_url, e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(registry_error(
                        &self.base_url,
                        format!("blob {} missing for tag '{tag}'", layer.digest),
                    ));
                }
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| registry_error(&self.base_url, e.to_string()))?;

                let tmp = tempfile::NamedTempFile::new().map_err(|e| {
                    registry_error(&self.base_url, format!("failed to stage blob: {e}"))
                })?;
                std::fs::write(tmp.path(), &bytes).map_err(|e| {
                    registry_error(&self.base_url, format!("failed to stage blob: {e}"))
                })?;
                layers.put(&layer.digest, parent.as_deref(), tmp.path())?;
            }
            parent = Some(layer.digest.clone());
        }

        tracing::info!(tag = %tag, registry = %self.base_url, "Pulled image");
        Ok(manifest)
    }
}

/// A tag like `hello:latest` as a single path segment.
fn sanitize_tag(tag: &str) -> String {
    tag.replace(['/', ':'], "_")
}

fn registry_error(registry: &str, message: impl Into<String>) -> StrataError {
    StrataError::RegistryError {
        registry: registry.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::LayerRef;
    use chrono::Utc;
    use tempfile::TempDir;

    fn make_cache(dir: &Path) -> LayerCache {
        LayerCache::new(dir).unwrap()
    }

    fn cache_layer(cache: &LayerCache, digest: &str, content: &[u8]) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), content).unwrap();
        cache.put(digest, None, tmp.path()).unwrap();
    }

    fn manifest_of(layers: &[&str]) -> ImageManifest {
        ImageManifest {
            schema_version: ImageManifest::SCHEMA_VERSION,
            layers: layers
                .iter()
                .map(|d| LayerRef {
                    digest: d.to_string(),
                    size: 4,
                })
                .collect(),
            entrypoint: Some(vec!["/app/server".to_string()]),
            cmd: None,
            env: vec![],
            user: None,
            workdir: "/".to_string(),
            exposed_ports: vec![3000],
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dir_registry_push_pull_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let registry = DirRegistry::new(&tmp.path().join("registry")).unwrap();

        let push_cache = make_cache(&tmp.path().join("push-cache"));
        cache_layer(&push_cache, "layer-one", b"one!");
        cache_layer(&push_cache, "layer-two", b"two!");

        let manifest = manifest_of(&["layer-one", "layer-two"]);
        let digest = registry
            .push(&manifest, "hello:latest", &push_cache)
            .await
            .unwrap();
        assert_eq!(digest, manifest.digest().unwrap());

        // Pull into a fresh cache
        let pull_cache = make_cache(&tmp.path().join("pull-cache"));
        let pulled = registry.pull("hello:latest", &pull_cache).await.unwrap();

        assert_eq!(pulled.digest().unwrap(), manifest.digest().unwrap());
        let blob = pull_cache.get("layer-one").unwrap().unwrap();
        assert_eq!(std::fs::read(&blob.path).unwrap(), b"one!");
        // Parent chain reconstructed from stack order
        let second = pull_cache.get("layer-two").unwrap().unwrap();
        assert_eq!(second.meta.parent.as_deref(), Some("layer-one"));
    }

    #[tokio::test]
    async fn test_dir_registry_pull_unknown_tag() {
        let tmp = TempDir::new().unwrap();
        let registry = DirRegistry::new(&tmp.path().join("registry")).unwrap();
        let cache = make_cache(&tmp.path().join("cache"));

        let err = registry.pull("ghost:latest", &cache).await.unwrap_err();
        assert!(matches!(err, StrataError::RegistryError { .. }));
        assert!(err.to_string().contains("ghost:latest"));
    }

    #[tokio::test]
    async fn test_dir_registry_push_missing_layer() {
        let tmp = TempDir::new().unwrap();
        let registry = DirRegistry::new(&tmp.path().join("registry")).unwrap();
        let cache = make_cache(&tmp.path().join("cache"));

        let manifest = manifest_of(&["never-cached"]);
        let err = registry
            .push(&manifest, "broken:latest", &cache)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("never-cached"));
    }

    #[tokio::test]
    async fn test_dir_registry_pull_skips_cached_blobs() {
        let tmp = TempDir::new().unwrap();
        let registry = DirRegistry::new(&tmp.path().join("registry")).unwrap();

        let cache = make_cache(&tmp.path().join("cache"));
        cache_layer(&cache, "shared", b"data");

        let manifest = manifest_of(&["shared"]);
        registry.push(&manifest, "app:latest", &cache).await.unwrap();

        // Remove the registry blob: pull must still succeed because the
        // cache already holds the layer
        std::fs::remove_file(tmp.path().join("registry/blobs/shared.tar.gz")).unwrap();
        let pulled = registry.pull("app:latest", &cache).await.unwrap();
        assert_eq!(pulled.layers[0].digest, "shared");
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag("hello:latest"), "hello_latest");
        assert_eq!(sanitize_tag("team/app:v1"), "team_app_v1");
    }

    #[test]
    fn test_registry_auth_from_env_fallback() {
        // Without both env vars set, auth is anonymous
        std::env::remove_var("REGISTRY_USERNAME");
        std::env::remove_var("REGISTRY_PASSWORD");
        assert!(RegistryAuth::from_env().is_anonymous());
        assert!(!RegistryAuth::basic("user", "pass").is_anonymous());
    }
}
