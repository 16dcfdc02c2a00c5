//! Build engine: compiles a Stratafile into a layer stack and manifest.
//!
//! Instructions run strictly in order. Every instruction advances a
//! digest chain seeded by the base image; layer-producing steps (COPY,
//! RUN) are keyed by their chain digest in the layer cache and skipped on
//! a hit. Metadata steps advance the chain without a payload, so
//! reordering them still invalidates everything downstream.
//!
//! Failure is all-or-nothing: the first failing step aborts the build
//! with its index and captured stderr, the in-progress layer is
//! discarded, and no manifest is produced. Layers completed before the
//! failure stay cached.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use strata_core::error::{Result, StrataError};

use super::executor::{default_executor, resolve_user, ExecRequest, StepExecutor};
use super::layer::{
    chain_digest, extract_layer, fingerprint_files, write_layer,
};
use crate::buildfile::{Buildfile, Instruction};
use crate::cache::LayerCache;
use crate::manifest::{ImageManifest, LayerRef};
use crate::store::ImageStore;

/// Reference given to builds without an explicit tag.
const DEFAULT_TAG: &str = "strata-build:latest";

/// Configuration for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Path to the Stratafile
    pub buildfile_path: PathBuf,
    /// Image reference to store the result under (e.g., "hello:latest")
    pub tag: Option<String>,
    /// Suppress step output
    pub quiet: bool,
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildResult {
    /// Reference the manifest was stored under
    pub reference: String,
    /// Manifest content digest
    pub digest: String,
    /// Number of layers in the final stack (base included)
    pub layer_count: usize,
    /// Layer-producing steps satisfied from cache
    pub cache_hits: usize,
    /// Total layer payload bytes
    pub size: u64,
}

/// Mutable state accumulated while walking the instruction list.
struct BuildState {
    /// Digest chain position after the last processed instruction
    chain: Option<String>,
    layers: Vec<LayerRef>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    env: Vec<(String, String)>,
    user: Option<String>,
    workdir: String,
    exposed_ports: Vec<u16>,
    cache_hits: usize,
}

impl BuildState {
    fn new() -> Self {
        Self {
            chain: None,
            layers: Vec::new(),
            entrypoint: None,
            cmd: None,
            env: Vec::new(),
            user: None,
            workdir: "/".to_string(),
            exposed_ports: Vec::new(),
            cache_hits: 0,
        }
    }
}

/// Builds images from Stratafiles against a shared cache and store.
pub struct Builder {
    cache: Arc<LayerCache>,
    store: Arc<ImageStore>,
    executor: Box<dyn StepExecutor>,
}

impl Builder {
    /// Builder with the executor picked for this host.
    pub fn new(cache: Arc<LayerCache>, store: Arc<ImageStore>) -> Self {
        Self::with_executor(cache, store, default_executor())
    }

    /// Builder with an explicit step executor.
    pub fn with_executor(
        cache: Arc<LayerCache>,
        store: Arc<ImageStore>,
        executor: Box<dyn StepExecutor>,
    ) -> Self {
        Self {
            cache,
            store,
            executor,
        }
    }

    /// Execute a full build: parse, walk instructions, assemble and store
    /// the manifest.
    pub async fn build(&self, config: &BuildConfig) -> Result<BuildResult> {
        let buildfile = Buildfile::from_file(&config.buildfile_path)?;

        let workspace = tempfile::TempDir::new()
            .map_err(|e| StrataError::BuildError(format!("Failed to create build workspace: {e}")))?;
        let rootfs = workspace.path().join("rootfs");
        let scratch = workspace.path().join("scratch");
        for dir in [&rootfs, &scratch] {
            std::fs::create_dir_all(dir).map_err(|e| {
                StrataError::BuildError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let mut state = BuildState::new();
        let total = buildfile.instructions.len();

        for (index, instruction) in buildfile.instructions.iter().enumerate() {
            if !config.quiet {
                println!("Step {}/{}: {}", index + 1, total, instruction.canonical());
            }

            match instruction {
                Instruction::From { image } => {
                    self.handle_from(image, instruction, &rootfs, &mut state).await?;
                }
                Instruction::Copy { sources, dest } => {
                    self.handle_copy(
                        instruction,
                        sources,
                        dest,
                        &config.context_dir,
                        &rootfs,
                        &scratch,
                        &mut state,
                    )?;
                }
                Instruction::Run { command } => {
                    self.handle_run(index, instruction, command, &rootfs, &scratch, &mut state)?;
                }
                Instruction::User { user } => {
                    state.user = Some(user.clone());
                    advance_chain(&mut state, instruction);
                }
                Instruction::Workdir { path } => {
                    state.workdir = resolve_path(&state.workdir, path);
                    let dir = rootfs.join(state.workdir.trim_start_matches('/'));
                    std::fs::create_dir_all(&dir).map_err(|e| {
                        StrataError::BuildError(format!(
                            "Failed to create workdir {}: {}",
                            dir.display(),
                            e
                        ))
                    })?;
                    advance_chain(&mut state, instruction);
                }
                Instruction::Env { key, value } => {
                    match state.env.iter_mut().find(|(k, _)| k == key) {
                        Some(existing) => existing.1 = value.clone(),
                        None => state.env.push((key.clone(), value.clone())),
                    }
                    advance_chain(&mut state, instruction);
                }
                Instruction::Expose { port } => {
                    if !state.exposed_ports.contains(port) {
                        state.exposed_ports.push(*port);
                    }
                    advance_chain(&mut state, instruction);
                }
                Instruction::Entrypoint { exec } => {
                    state.entrypoint = Some(exec.clone());
                    advance_chain(&mut state, instruction);
                }
                Instruction::Cmd { exec } => {
                    state.cmd = Some(exec.clone());
                    advance_chain(&mut state, instruction);
                }
            }
        }

        if state.entrypoint.is_none() && state.cmd.is_none() {
            return Err(StrataError::BuildError(
                "Image declares no ENTRYPOINT or CMD; the result would not be runnable".to_string(),
            ));
        }

        let manifest = ImageManifest {
            schema_version: ImageManifest::SCHEMA_VERSION,
            layers: state.layers.clone(),
            entrypoint: state.entrypoint.clone(),
            cmd: state.cmd.clone(),
            env: state.env.clone(),
            user: state.user.clone(),
            workdir: state.workdir.clone(),
            exposed_ports: state.exposed_ports.clone(),
            created: Utc::now(),
        };

        let reference = config.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string());
        let stored = self.store.put(&reference, &manifest).await?;

        if !config.quiet {
            println!(
                "Successfully built {} ({} layers, {} cached)",
                reference,
                manifest.layers.len(),
                state.cache_hits
            );
        }

        Ok(BuildResult {
            reference,
            digest: stored.digest,
            layer_count: manifest.layers.len(),
            cache_hits: state.cache_hits,
            size: manifest.total_size(),
        })
    }

    /// FROM: seed the chain and rootfs from the base image (or scratch).
    async fn handle_from(
        &self,
        image: &str,
        instruction: &Instruction,
        rootfs: &Path,
        state: &mut BuildState,
    ) -> Result<()> {
        if image == "scratch" {
            state.chain = Some(chain_digest(None, &instruction.canonical(), &[]));
            return Ok(());
        }

        let (stored, base) = self.store.resolve(image).await.map_err(|_| {
            StrataError::ImageError(format!(
                "Base image '{image}' not found in local store; pull or build it first"
            ))
        })?;

        for layer in &base.layers {
            let cached = self.cache.get(&layer.digest)?.ok_or_else(|| {
                StrataError::ImageError(format!(
                    "Base image layer {} missing from cache; pull '{}' again",
                    layer.digest, image
                ))
            })?;
            extract_layer(&cached.path, rootfs)?;
        }

        state.layers = base.layers.clone();
        state.entrypoint = base.entrypoint.clone();
        state.cmd = base.cmd.clone();
        state.env = base.env.clone();
        state.user = base.user.clone();
        state.workdir = base.workdir.clone();
        state.exposed_ports = base.exposed_ports.clone();
        state.chain = Some(chain_digest(
            None,
            &instruction.canonical(),
            stored.digest.as_bytes(),
        ));

        Ok(())
    }

    /// COPY: resolve globs, hash contents, reuse or materialize the layer.
    #[allow(clippy::too_many_arguments)]
    fn handle_copy(
        &self,
        instruction: &Instruction,
        sources: &[String],
        dest: &str,
        context_dir: &Path,
        rootfs: &Path,
        scratch: &Path,
        state: &mut BuildState,
    ) -> Result<()> {
        let plan = plan_copy(context_dir, sources, dest, &state.workdir)?;
        let fingerprint = fingerprint_files(&plan.fingerprint_inputs())?;
        let digest = chain_digest(
            state.chain.as_deref(),
            &instruction.canonical(),
            &fingerprint,
        );

        if self.reuse_cached(&digest, rootfs, state)? {
            state.chain = Some(digest);
            return Ok(());
        }

        let _lock = self.cache.lock(&digest)?;
        if self.reuse_cached(&digest, rootfs, state)? {
            state.chain = Some(digest);
            return Ok(());
        }

        let mut changed = Vec::new();
        for op in &plan.files {
            let target = rootfs.join(op.target_rel.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StrataError::BuildError(format!(
                        "Failed to create COPY destination {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            std::fs::copy(&op.source, &target).map_err(|e| {
                StrataError::BuildError(format!(
                    "Failed to copy {} to {}: {}",
                    op.source.display(),
                    target.display(),
                    e
                ))
            })?;
            changed.push(PathBuf::from(op.target_rel.trim_start_matches('/')));
        }

        let payload = write_layer(rootfs, &changed, &scratch.join(format!("{digest}.tar.gz")))?;
        let cached = self
            .cache
            .put(&digest, state.chain.as_deref(), &payload.path)?;

        state.layers.push(LayerRef {
            digest: digest.clone(),
            size: cached.meta.size_bytes,
        });
        state.chain = Some(digest);
        Ok(())
    }

    /// RUN: execute (or reuse) one command layer.
    fn handle_run(
        &self,
        index: usize,
        instruction: &Instruction,
        command: &str,
        rootfs: &Path,
        scratch: &Path,
        state: &mut BuildState,
    ) -> Result<()> {
        let digest = chain_digest(state.chain.as_deref(), &instruction.canonical(), &[]);

        if self.reuse_cached(&digest, rootfs, state)? {
            state.chain = Some(digest);
            return Ok(());
        }

        let _lock = self.cache.lock(&digest)?;
        if self.reuse_cached(&digest, rootfs, state)? {
            state.chain = Some(digest);
            return Ok(());
        }

        // Resolve the step identity up front; running as the wrong user by
        // omission is exactly what the USER directive forbids.
        let identity = match &state.user {
            Some(user) => {
                let identity = resolve_user(rootfs, user)?;
                if !self.executor.can_run_as(identity.0) {
                    return Err(StrataError::PermissionFailure {
                        index,
                        instruction: instruction.canonical(),
                        user: user.clone(),
                    });
                }
                Some(identity)
            }
            None => None,
        };

        let workdir_abs = rootfs.join(state.workdir.trim_start_matches('/'));
        std::fs::create_dir_all(&workdir_abs).map_err(|e| {
            StrataError::BuildError(format!(
                "Failed to create workdir {}: {}",
                workdir_abs.display(),
                e
            ))
        })?;

        let before = super::layer::DirSnapshot::capture(rootfs)?;
        let output = self.executor.execute(&ExecRequest {
            rootfs,
            command,
            identity,
            workdir: &state.workdir,
            env: &state.env,
        })?;

        if !output.success() {
            if output.permission_denied() {
                return Err(StrataError::PermissionFailure {
                    index,
                    instruction: instruction.canonical(),
                    user: state.user.clone().unwrap_or_else(|| "root".to_string()),
                });
            }
            return Err(StrataError::BuildInstructionFailure {
                index,
                instruction: instruction.canonical(),
                stderr: output.stderr_lossy(),
            });
        }

        let after = super::layer::DirSnapshot::capture(rootfs)?;
        let changed = before.diff(&after);

        let payload = write_layer(rootfs, &changed, &scratch.join(format!("{digest}.tar.gz")))?;
        let cached = self
            .cache
            .put(&digest, state.chain.as_deref(), &payload.path)?;

        state.layers.push(LayerRef {
            digest: digest.clone(),
            size: cached.meta.size_bytes,
        });
        state.chain = Some(digest);
        Ok(())
    }

    /// On a cache hit, replay the cached delta onto the rootfs instead of
    /// re-executing the step.
    fn reuse_cached(&self, digest: &str, rootfs: &Path, state: &mut BuildState) -> Result<bool> {
        let Some(cached) = self.cache.get(digest)? else {
            return Ok(false);
        };

        tracing::info!(digest = %digest, "Layer cache hit");
        extract_layer(&cached.path, rootfs)?;
        state.layers.push(LayerRef {
            digest: digest.to_string(),
            size: cached.meta.size_bytes,
        });
        state.cache_hits += 1;
        Ok(true)
    }
}

/// Advance the digest chain for a metadata-only instruction.
fn advance_chain(state: &mut BuildState, instruction: &Instruction) {
    state.chain = Some(chain_digest(
        state.chain.as_deref(),
        &instruction.canonical(),
        &[],
    ));
}

/// One planned file copy.
struct CopyOp {
    /// Path relative to the build context (fingerprint label)
    label: String,
    /// Absolute source path
    source: PathBuf,
    /// Absolute destination inside the image
    target_rel: String,
}

/// Expanded COPY instruction: every concrete file it will place.
struct CopyPlan {
    files: Vec<CopyOp>,
}

impl CopyPlan {
    fn fingerprint_inputs(&self) -> Vec<(String, PathBuf)> {
        self.files
            .iter()
            .map(|op| (op.label.clone(), op.source.clone()))
            .collect()
    }
}

/// Expand COPY source patterns against the build context.
///
/// Every pattern must match at least one entry; a pattern that matches
/// nothing fails the build rather than shipping an empty layer. Matched
/// directories contribute their contents (not the directory node itself).
fn plan_copy(
    context_dir: &Path,
    sources: &[String],
    dest: &str,
    workdir: &str,
) -> Result<CopyPlan> {
    let resolved_dest = resolve_path(workdir, dest);

    let mut matches: Vec<PathBuf> = Vec::new();
    for pattern in sources {
        let full_pattern = context_dir.join(pattern);
        let glob_iter = glob::glob(&full_pattern.to_string_lossy()).map_err(|e| {
            StrataError::BuildfileError(format!("Invalid COPY pattern '{pattern}': {e}"))
        })?;

        let mut matched_any = false;
        for entry in glob_iter {
            let path = entry.map_err(|e| {
                StrataError::BuildError(format!("Failed to read COPY match: {e}"))
            })?;
            matched_any = true;
            matches.push(path);
        }

        if !matched_any {
            return Err(StrataError::GlobMatchFailure {
                pattern: pattern.clone(),
            });
        }
    }

    let into_dir =
        dest.ends_with('/') || matches.len() > 1 || matches.first().is_some_and(|p| p.is_dir());

    let mut files = Vec::new();
    for path in &matches {
        if path.is_dir() {
            collect_dir_files(context_dir, path, path, &resolved_dest, &mut files)?;
        } else {
            let label = label_for(context_dir, path);
            let target_rel = if into_dir {
                join_image_path(&resolved_dest, &file_name_of(path))
            } else {
                resolved_dest.clone()
            };
            files.push(CopyOp {
                label,
                source: path.clone(),
                target_rel,
            });
        }
    }

    Ok(CopyPlan { files })
}

/// Recursively plan a matched directory's contents into the destination.
fn collect_dir_files(
    context_dir: &Path,
    dir_root: &Path,
    current: &Path,
    dest: &str,
    files: &mut Vec<CopyOp>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StrataError::BuildError(format!("Failed to read {}: {}", current.display(), e))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| StrataError::BuildError(format!("Failed to read COPY entry: {e}")))?;
        let path = entry.path();
        if path.is_dir() {
            collect_dir_files(context_dir, dir_root, &path, dest, files)?;
        } else {
            let sub = path
                .strip_prefix(dir_root)
                .map_err(|e| StrataError::BuildError(format!("COPY path escape: {e}")))?;
            files.push(CopyOp {
                label: label_for(context_dir, &path),
                source: path.clone(),
                target_rel: join_image_path(dest, &sub.to_string_lossy()),
            });
        }
    }
    Ok(())
}

fn label_for(context_dir: &Path, path: &Path) -> String {
    path.strip_prefix(context_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Join a path inside the image namespace.
fn join_image_path(base: &str, rest: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rest)
}

/// Resolve a path against a working directory. Absolute paths pass
/// through; relative ones join the workdir.
fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::executor::ExecOutput;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Executor test double: counts invocations and runs a closure
    /// against the rootfs.
    struct ScriptedExecutor<F> {
        calls: Arc<AtomicUsize>,
        allow_uid: Option<u32>,
        script: F,
    }

    impl<F> StepExecutor for ScriptedExecutor<F>
    where
        F: Fn(&ExecRequest<'_>) -> ExecOutput + Send + Sync,
    {
        fn can_run_as(&self, uid: u32) -> bool {
            self.allow_uid.map(|allowed| allowed == uid).unwrap_or(true)
        }

        fn execute(&self, req: &ExecRequest<'_>) -> strata_core::error::Result<ExecOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.script)(req))
        }
    }

    fn ok_output() -> ExecOutput {
        ExecOutput {
            code: 0,
            stdout: vec![],
            stderr: vec![],
        }
    }

    struct Fixture {
        _home: TempDir,
        context: TempDir,
        cache: Arc<crate::cache::LayerCache>,
        store: Arc<ImageStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let home = TempDir::new().unwrap();
            let cache =
                Arc::new(crate::cache::LayerCache::new(&home.path().join("layers")).unwrap());
            let store = Arc::new(ImageStore::new(&home.path().join("images"), u64::MAX).unwrap());
            Fixture {
                _home: home,
                context: TempDir::new().unwrap(),
                cache,
                store,
            }
        }

        fn write_buildfile(&self, content: &str) -> PathBuf {
            let path = self.context.path().join("Stratafile");
            fs::write(&path, content).unwrap();
            path
        }

        fn config(&self, buildfile: PathBuf, tag: &str) -> BuildConfig {
            BuildConfig {
                context_dir: self.context.path().to_path_buf(),
                buildfile_path: buildfile,
                tag: Some(tag.to_string()),
                quiet: true,
            }
        }

        fn builder(&self) -> Builder {
            Builder::with_executor(
                Arc::clone(&self.cache),
                Arc::clone(&self.store),
                Box::new(ScriptedExecutor {
                    calls: Arc::new(AtomicUsize::new(0)),
                    allow_uid: None,
                    script: |_req: &ExecRequest<'_>| ok_output(),
                }),
            )
        }
    }

    const HELLO_BUILDFILE: &str = "FROM scratch\n\
         WORKDIR /app\n\
         COPY server /app/server\n\
         EXPOSE 3000\n\
         ENTRYPOINT [\"/app/server\"]\n";

    #[tokio::test]
    async fn test_build_scratch_copy_image() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("server"), "fake binary").unwrap();
        let buildfile = fx.write_buildfile(HELLO_BUILDFILE);

        let result = fx
            .builder()
            .build(&fx.config(buildfile, "hello:latest"))
            .await
            .unwrap();

        assert_eq!(result.reference, "hello:latest");
        assert_eq!(result.layer_count, 1);
        assert_eq!(result.cache_hits, 0);

        let (_, manifest) = fx.store.resolve("hello:latest").await.unwrap();
        assert_eq!(manifest.exposed_ports, vec![3000]);
        assert_eq!(manifest.workdir, "/app");
        assert_eq!(manifest.argv().unwrap(), vec!["/app/server"]);
        assert!(fx.cache.get(&manifest.layers[0].digest).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rebuild_identical_digests_and_full_cache_hits() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("server"), "fake binary").unwrap();
        let buildfile = fx.write_buildfile(HELLO_BUILDFILE);

        let first = fx
            .builder()
            .build(&fx.config(buildfile.clone(), "hello:v1"))
            .await
            .unwrap();
        let second = fx
            .builder()
            .build(&fx.config(buildfile, "hello:v2"))
            .await
            .unwrap();

        // Identical instruction sequence + unchanged context ⇒ identical
        // layer digests, all reused
        let (_, m1) = fx.store.resolve("hello:v1").await.unwrap();
        let (_, m2) = fx.store.resolve("hello:v2").await.unwrap();
        assert_eq!(m1.layers, m2.layers);
        assert_eq!(first.digest, second.digest);
        assert_eq!(second.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_prefix_after_divergence() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("deps.txt"), "stable deps").unwrap();
        fs::write(fx.context.path().join("app.txt"), "v1 source").unwrap();

        let content = "FROM scratch\n\
             COPY deps.txt /deps.txt\n\
             COPY app.txt /app.txt\n\
             ENTRYPOINT [\"/app.txt\"]\n";
        let buildfile = fx.write_buildfile(content);

        let _ = fx
            .builder()
            .build(&fx.config(buildfile.clone(), "app:v1"))
            .await
            .unwrap();

        // Change only the later input
        fs::write(fx.context.path().join("app.txt"), "v2 source").unwrap();
        let second = fx
            .builder()
            .build(&fx.config(buildfile, "app:v2"))
            .await
            .unwrap();

        let (_, m1) = fx.store.resolve("app:v1").await.unwrap();
        let (_, m2) = fx.store.resolve("app:v2").await.unwrap();

        // Shared prefix reused from cache; divergent tail rebuilt
        assert_eq!(m1.layers[0], m2.layers[0]);
        assert_ne!(m1.layers[1], m2.layers[1]);
        assert_eq!(second.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_copy_glob_no_match_fails() {
        let fx = Fixture::new();
        let buildfile = fx.write_buildfile(
            "FROM scratch\nCOPY missing-*.txt /app/\nENTRYPOINT [\"/app/x\"]\n",
        );

        let err = fx
            .builder()
            .build(&fx.config(buildfile, "broken:latest"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StrataError::GlobMatchFailure { ref pattern } if pattern == "missing-*.txt"
        ));
        // All-or-nothing: no manifest was stored
        assert!(fx.store.get("broken:latest").await.is_none());
    }

    #[tokio::test]
    async fn test_copy_glob_expansion() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("a.conf"), "a").unwrap();
        fs::write(fx.context.path().join("b.conf"), "b").unwrap();
        fs::write(fx.context.path().join("ignored.txt"), "x").unwrap();
        let buildfile = fx.write_buildfile(
            "FROM scratch\nCOPY *.conf /etc/app/\nENTRYPOINT [\"/bin/true\"]\n",
        );

        let _ = fx
            .builder()
            .build(&fx.config(buildfile, "conf:latest"))
            .await
            .unwrap();

        let (_, manifest) = fx.store.resolve("conf:latest").await.unwrap();
        let cached = fx.cache.get(&manifest.layers[0].digest).unwrap().unwrap();
        let target = TempDir::new().unwrap();
        extract_layer(&cached.path, target.path()).unwrap();
        assert!(target.path().join("etc/app/a.conf").exists());
        assert!(target.path().join("etc/app/b.conf").exists());
        assert!(!target.path().join("etc/app/ignored.txt").exists());
    }

    #[tokio::test]
    async fn test_run_failure_reports_index_and_stderr() {
        let fx = Fixture::new();
        let buildfile =
            fx.write_buildfile("FROM scratch\nRUN apk add curl\nENTRYPOINT [\"/bin/true\"]\n");

        let builder = Builder::with_executor(
            Arc::clone(&fx.cache),
            Arc::clone(&fx.store),
            Box::new(ScriptedExecutor {
                calls: Arc::new(AtomicUsize::new(0)),
                allow_uid: None,
                script: |_req: &ExecRequest<'_>| ExecOutput {
                    code: 1,
                    stdout: vec![],
                    stderr: b"apk: command not found".to_vec(),
                },
            }),
        );

        let err = builder
            .build(&fx.config(buildfile, "fail:latest"))
            .await
            .unwrap_err();

        match err {
            StrataError::BuildInstructionFailure {
                index,
                instruction,
                stderr,
            } => {
                assert_eq!(index, 1);
                assert_eq!(instruction, "RUN apk add curl");
                assert_eq!(stderr, "apk: command not found");
            }
            other => panic!("expected BuildInstructionFailure, got {other:?}"),
        }
        assert!(fx.store.get("fail:latest").await.is_none());
    }

    #[tokio::test]
    async fn test_user_then_privileged_run_is_permission_failure() {
        let fx = Fixture::new();
        let buildfile = fx.write_buildfile(
            "FROM scratch\nUSER 1000\nRUN apk add build-base\nENTRYPOINT [\"/bin/true\"]\n",
        );

        // The step runs as uid 1000 and the package manager needs root
        let builder = Builder::with_executor(
            Arc::clone(&fx.cache),
            Arc::clone(&fx.store),
            Box::new(ScriptedExecutor {
                calls: Arc::new(AtomicUsize::new(0)),
                allow_uid: None,
                script: |req: &ExecRequest<'_>| {
                    assert_eq!(req.identity, Some((1000, 1000)));
                    ExecOutput {
                        code: 1,
                        stdout: vec![],
                        stderr: b"ERROR: Unable to lock database: Permission denied".to_vec(),
                    }
                },
            }),
        );

        let err = builder
            .build(&fx.config(buildfile, "priv:latest"))
            .await
            .unwrap_err();

        match err {
            StrataError::PermissionFailure { index, user, .. } => {
                assert_eq!(index, 2);
                assert_eq!(user, "1000");
            }
            other => panic!("expected PermissionFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_executor_refuses_unadoptable_identity() {
        let fx = Fixture::new();
        let buildfile = fx.write_buildfile(
            "FROM scratch\nUSER 1000\nRUN touch /marker\nENTRYPOINT [\"/bin/true\"]\n",
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let builder = Builder::with_executor(
            Arc::clone(&fx.cache),
            Arc::clone(&fx.store),
            Box::new(ScriptedExecutor {
                calls: Arc::clone(&calls),
                allow_uid: Some(0), // can only run as root
                script: |_req: &ExecRequest<'_>| ok_output(),
            }),
        );

        let err = builder
            .build(&fx.config(buildfile, "refused:latest"))
            .await
            .unwrap_err();

        assert!(matches!(err, StrataError::PermissionFailure { .. }));
        // Never silently ran as the wrong identity
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_executed_once_then_cached() {
        let fx = Fixture::new();
        let buildfile = fx.write_buildfile(
            "FROM scratch\nRUN generate-data\nENTRYPOINT [\"/bin/true\"]\n",
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let make_builder = |calls: Arc<AtomicUsize>| {
            Builder::with_executor(
                Arc::clone(&fx.cache),
                Arc::clone(&fx.store),
                Box::new(ScriptedExecutor {
                    calls,
                    allow_uid: None,
                    script: |req: &ExecRequest<'_>| {
                        fs::write(req.rootfs.join("generated.txt"), "data").unwrap();
                        ok_output()
                    },
                }),
            )
        };

        make_builder(Arc::clone(&calls))
            .build(&fx.config(buildfile.clone(), "gen:v1"))
            .await
            .unwrap();
        let second = make_builder(Arc::clone(&calls))
            .build(&fx.config(buildfile, "gen:v2"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_run_delta_captured_in_layer() {
        let fx = Fixture::new();
        let buildfile = fx.write_buildfile(
            "FROM scratch\nRUN make-output\nENTRYPOINT [\"/out/result\"]\n",
        );

        let builder = Builder::with_executor(
            Arc::clone(&fx.cache),
            Arc::clone(&fx.store),
            Box::new(ScriptedExecutor {
                calls: Arc::new(AtomicUsize::new(0)),
                allow_uid: None,
                script: |req: &ExecRequest<'_>| {
                    fs::create_dir_all(req.rootfs.join("out")).unwrap();
                    fs::write(req.rootfs.join("out/result"), "built").unwrap();
                    ok_output()
                },
            }),
        );

        let _ = builder
            .build(&fx.config(buildfile, "delta:latest"))
            .await
            .unwrap();

        let (_, manifest) = fx.store.resolve("delta:latest").await.unwrap();
        let cached = fx.cache.get(&manifest.layers[0].digest).unwrap().unwrap();
        let target = TempDir::new().unwrap();
        extract_layer(&cached.path, target.path()).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("out/result")).unwrap(),
            "built"
        );
    }

    #[tokio::test]
    async fn test_metadata_reorder_invalidates_downstream_layers() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("app.txt"), "source").unwrap();

        let before = fx.write_buildfile(
            "FROM scratch\nENV MODE=a\nCOPY app.txt /app.txt\nENTRYPOINT [\"/app.txt\"]\n",
        );
        let _ = fx
            .builder()
            .build(&fx.config(before, "meta:v1"))
            .await
            .unwrap();

        let after = fx.write_buildfile(
            "FROM scratch\nENV MODE=b\nCOPY app.txt /app.txt\nENTRYPOINT [\"/app.txt\"]\n",
        );
        let second = fx
            .builder()
            .build(&fx.config(after, "meta:v2"))
            .await
            .unwrap();

        let (_, m1) = fx.store.resolve("meta:v1").await.unwrap();
        let (_, m2) = fx.store.resolve("meta:v2").await.unwrap();
        // The ENV change flows through the chain even though it has no payload
        assert_ne!(m1.layers[0].digest, m2.layers[0].digest);
        assert_eq!(second.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_build_requires_entrypoint_or_cmd() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("a.txt"), "a").unwrap();
        let buildfile = fx.write_buildfile("FROM scratch\nCOPY a.txt /a.txt\n");

        let err = fx
            .builder()
            .build(&fx.config(buildfile, "norun:latest"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ENTRYPOINT or CMD"));
    }

    #[tokio::test]
    async fn test_build_from_unknown_base_fails() {
        let fx = Fixture::new();
        let buildfile =
            fx.write_buildfile("FROM ghost:latest\nENTRYPOINT [\"/bin/true\"]\n");

        let err = fx
            .builder()
            .build(&fx.config(buildfile, "orphan:latest"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found in local store"));
    }

    #[tokio::test]
    async fn test_build_on_base_image_inherits_metadata() {
        let fx = Fixture::new();
        fs::write(fx.context.path().join("base.txt"), "base layer").unwrap();
        let base = fx.write_buildfile(
            "FROM scratch\n\
             WORKDIR /srv\n\
             ENV STAGE=base\n\
             COPY base.txt /srv/base.txt\n\
             EXPOSE 8080\n\
             ENTRYPOINT [\"/srv/base.txt\"]\n",
        );
        let _ = fx
            .builder()
            .build(&fx.config(base, "base:latest"))
            .await
            .unwrap();

        fs::write(fx.context.path().join("extra.txt"), "extra layer").unwrap();
        let child = fx.write_buildfile(
            "FROM base:latest\nCOPY extra.txt /srv/extra.txt\n",
        );
        let result = fx
            .builder()
            .build(&fx.config(child, "child:latest"))
            .await
            .unwrap();

        // Base layer + new layer
        assert_eq!(result.layer_count, 2);
        let (_, manifest) = fx.store.resolve("child:latest").await.unwrap();
        assert_eq!(manifest.workdir, "/srv");
        assert_eq!(manifest.exposed_ports, vec![8080]);
        assert_eq!(manifest.argv().unwrap(), vec!["/srv/base.txt"]);
        assert_eq!(
            manifest.env,
            vec![("STAGE".to_string(), "base".to_string())]
        );
    }

    #[tokio::test]
    async fn test_host_executor_end_to_end_run() {
        let fx = Fixture::new();
        let buildfile = fx.write_buildfile(
            "FROM scratch\n\
             WORKDIR /data\n\
             RUN printf generated > out.txt\n\
             ENTRYPOINT [\"/data/out.txt\"]\n",
        );

        let builder = Builder::with_executor(
            Arc::clone(&fx.cache),
            Arc::clone(&fx.store),
            Box::new(crate::build::executor::HostExecutor),
        );
        let result = builder
            .build(&fx.config(buildfile, "real:latest"))
            .await
            .unwrap();
        assert_eq!(result.layer_count, 1);

        let (_, manifest) = fx.store.resolve("real:latest").await.unwrap();
        let cached = fx.cache.get(&manifest.layers[0].digest).unwrap().unwrap();
        let target = TempDir::new().unwrap();
        extract_layer(&cached.path, target.path()).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("data/out.txt")).unwrap(),
            "generated"
        );
    }

    // --- helpers ---

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/app", "/usr/bin"), "/usr/bin");
        assert_eq!(resolve_path("/app", "src"), "/app/src");
        assert_eq!(resolve_path("/", "app"), "/app");
    }

    #[test]
    fn test_plan_copy_single_file_to_path() {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("server"), "bin").unwrap();

        let plan = plan_copy(ctx.path(), &["server".to_string()], "/app/server", "/").unwrap();
        assert_eq!(plan.files.len(), 1);
        assert_eq!(plan.files[0].target_rel, "/app/server");
    }

    #[test]
    fn test_plan_copy_into_directory() {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("a.txt"), "a").unwrap();
        fs::write(ctx.path().join("b.txt"), "b").unwrap();

        let plan = plan_copy(ctx.path(), &["*.txt".to_string()], "/app/", "/").unwrap();
        let mut targets: Vec<&str> = plan.files.iter().map(|f| f.target_rel.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["/app/a.txt", "/app/b.txt"]);
    }

    #[test]
    fn test_plan_copy_directory_contents() {
        let ctx = TempDir::new().unwrap();
        fs::create_dir_all(ctx.path().join("src/lib")).unwrap();
        fs::write(ctx.path().join("src/main.js"), "x").unwrap();
        fs::write(ctx.path().join("src/lib/util.js"), "y").unwrap();

        let plan = plan_copy(ctx.path(), &["src".to_string()], "/app", "/").unwrap();
        let mut targets: Vec<&str> = plan.files.iter().map(|f| f.target_rel.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["/app/lib/util.js", "/app/main.js"]);
    }

    #[test]
    fn test_plan_copy_relative_dest_uses_workdir() {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("conf.toml"), "x").unwrap();

        let plan = plan_copy(ctx.path(), &["conf.toml".to_string()], "conf.toml", "/etc/app")
            .unwrap();
        assert_eq!(plan.files[0].target_rel, "/etc/app/conf.toml");
    }
}
