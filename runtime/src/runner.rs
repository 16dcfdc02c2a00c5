//! Container runner: manifest in, supervised process out.
//!
//! The runner never mutates a manifest or its layers. It extracts the
//! layer stack into a fresh per-container rootfs, verifies the entrypoint
//! actually exists (`MissingDependencyFailure` otherwise), binds the
//! requested port forwarders, and spawns the entrypoint process: chroot
//! plus setuid when running as root on Linux, a rootfs-relative spawn
//! otherwise.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use strata_core::error::{Result, StrataError};
use tokio::process::{Child, Command};

use crate::build::executor::{current_uid, resolve_user};
use crate::build::layer::extract_layer;
use crate::cache::LayerCache;
use crate::manifest::ImageManifest;
use crate::net::{PortForwarder, PortMapping};

/// Default PATH inside a running container.
const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// How long a stopping container gets between SIGTERM and SIGKILL.
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// A live container process and its plumbing.
#[derive(Debug)]
pub struct RunningContainer {
    /// Container id (UUID)
    pub id: String,
    /// Image reference it was started from
    pub reference: String,
    /// Manifest digest
    pub digest: String,
    /// Entrypoint process id
    pub pid: u32,
    /// Per-container rootfs directory
    pub rootfs: PathBuf,
    /// Active port mappings
    pub ports: Vec<PortMapping>,
    child: Child,
    /// Held for lifetime; forwarding stops when the container is dropped
    #[allow(dead_code)]
    forwarders: Vec<PortForwarder>,
}

impl RunningContainer {
    /// Wait for the entrypoint process to exit; returns its exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| StrataError::ContainerError(format!("Failed to wait on container: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Stop the container: SIGTERM, a grace period, then SIGKILL.
    pub async fn stop(&mut self) -> Result<()> {
        signal_stop(self.pid);
        let graceful =
            tokio::time::timeout(STOP_GRACE, self.child.wait()).await;
        if graceful.is_err() {
            self.child.kill().await.map_err(|e| {
                StrataError::ContainerError(format!("Failed to kill container {}: {e}", self.id))
            })?;
        }
        tracing::info!(id = %self.id, "Container stopped");
        Ok(())
    }

    /// Remove the container's rootfs directory.
    pub fn remove_rootfs(&self) -> Result<()> {
        if let Some(container_dir) = self.rootfs.parent() {
            if container_dir.exists() {
                std::fs::remove_dir_all(container_dir).map_err(|e| {
                    StrataError::ContainerError(format!(
                        "Failed to remove container directory {}: {}",
                        container_dir.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

/// Send SIGTERM to a container process by pid.
pub fn signal_stop(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Whether a process with this pid is still alive.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Instantiates manifests as running containers.
pub struct ContainerRunner {
    cache: Arc<LayerCache>,
    containers_dir: PathBuf,
    /// chroot + setuid into the rootfs (requires root)
    isolate: bool,
}

impl ContainerRunner {
    /// Runner with isolation picked for this host: chroot when running as
    /// root on Linux, the rootfs-relative fallback otherwise.
    pub fn new(cache: Arc<LayerCache>, containers_dir: &Path) -> Result<Self> {
        let isolate = cfg!(target_os = "linux") && current_uid() == 0;
        Self::with_isolation(cache, containers_dir, isolate)
    }

    /// Runner with an explicit isolation mode.
    pub fn with_isolation(
        cache: Arc<LayerCache>,
        containers_dir: &Path,
        isolate: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(containers_dir).map_err(|e| {
            StrataError::ContainerError(format!(
                "Failed to create containers directory {}: {}",
                containers_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            cache,
            containers_dir: containers_dir.to_path_buf(),
            isolate,
        })
    }

    /// Instantiate a manifest: materialize the rootfs, bind port
    /// forwarders, and spawn the entrypoint.
    ///
    /// `interactive` wires the container's stdin to the caller's;
    /// otherwise stdin is closed. Port binding happens before the spawn so
    /// an occupied host port aborts startup cleanly.
    pub async fn run(
        &self,
        reference: &str,
        manifest: &ImageManifest,
        ports: &[PortMapping],
        interactive: bool,
    ) -> Result<RunningContainer> {
        let id = uuid::Uuid::new_v4().to_string();
        let rootfs = self.containers_dir.join(&id).join("rootfs");

        self.materialize_rootfs(manifest, &rootfs)?;

        let argv = manifest.argv().ok_or_else(|| {
            StrataError::ContainerError(format!("Image '{reference}' has no entrypoint"))
        })?;
        let program = resolve_entrypoint(&rootfs, &manifest.workdir, &argv[0])?;

        let mut forwarders = Vec::with_capacity(ports.len());
        for mapping in ports {
            forwarders.push(PortForwarder::bind(mapping.host, mapping.container).await?);
        }

        let child = self.spawn(manifest, &rootfs, &argv, &program, interactive)?;
        let pid = child.id().ok_or_else(|| {
            StrataError::ContainerError("Container exited before startup completed".to_string())
        })?;

        tracing::info!(
            id = %id,
            reference = %reference,
            pid,
            ports = %ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
            "Container started"
        );

        Ok(RunningContainer {
            id,
            reference: reference.to_string(),
            digest: manifest.digest()?,
            pid,
            rootfs,
            ports: ports.to_vec(),
            child,
            forwarders,
        })
    }

    /// Extract the manifest's layers, in order, into a fresh rootfs.
    fn materialize_rootfs(&self, manifest: &ImageManifest, rootfs: &Path) -> Result<()> {
        std::fs::create_dir_all(rootfs).map_err(|e| {
            StrataError::ContainerError(format!(
                "Failed to create rootfs {}: {}",
                rootfs.display(),
                e
            ))
        })?;

        for layer in &manifest.layers {
            let cached = self.cache.get(&layer.digest)?.ok_or_else(|| {
                StrataError::MissingDependencyFailure(format!(
                    "layer {} is not in the local cache; rebuild or pull the image",
                    layer.digest
                ))
            })?;
            extract_layer(&cached.path, rootfs)?;
        }

        // WORKDIR is metadata; no layer guarantees the directory exists
        let workdir = rootfs.join(manifest.workdir.trim_start_matches('/'));
        std::fs::create_dir_all(&workdir).map_err(|e| {
            StrataError::ContainerError(format!(
                "Failed to create workdir {}: {}",
                workdir.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn spawn(
        &self,
        manifest: &ImageManifest,
        rootfs: &Path,
        argv: &[String],
        program: &Path,
        interactive: bool,
    ) -> Result<Child> {
        let mut cmd = if self.isolate {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);

            let rootfs = rootfs.to_path_buf();
            let workdir = manifest.workdir.clone();
            let identity = match &manifest.user {
                Some(user) => Some(resolve_user(&rootfs, user)?),
                None => None,
            };
            unsafe {
                cmd.pre_exec(move || {
                    let root = std::ffi::CString::new(rootfs.as_os_str().as_encoded_bytes())
                        .map_err(|_| std::io::Error::other("rootfs path contains NUL"))?;
                    if libc::chroot(root.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let dir = std::ffi::CString::new(workdir.as_bytes())
                        .map_err(|_| std::io::Error::other("workdir contains NUL"))?;
                    if libc::chdir(dir.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if let Some((uid, gid)) = identity {
                        if libc::setgid(gid) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        if libc::setuid(uid) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
            cmd
        } else {
            // Unprivileged fallback: spawn the rootfs-resolved binary with
            // the rootfs-joined workdir as cwd, no isolation.
            if let Some(user) = &manifest.user {
                let (uid, _) = resolve_user(rootfs, user)?;
                if uid != current_uid() {
                    return Err(StrataError::ContainerError(format!(
                        "cannot run as user '{user}' without root"
                    )));
                }
            }
            let mut cmd = Command::new(program);
            cmd.args(&argv[1..]);
            cmd.current_dir(rootfs.join(manifest.workdir.trim_start_matches('/')));
            cmd
        };

        cmd.env_clear();
        cmd.env("PATH", CONTAINER_PATH);
        for (key, value) in &manifest.env {
            cmd.env(key, value);
        }

        cmd.stdin(if interactive {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| StrataError::ContainerError(format!("Failed to start entrypoint: {e}")))
    }
}

/// Check the entrypoint binary exists in the rootfs and return its
/// host-side path.
fn resolve_entrypoint(rootfs: &Path, workdir: &str, argv0: &str) -> Result<PathBuf> {
    let candidate = if argv0.starts_with('/') {
        rootfs.join(argv0.trim_start_matches('/'))
    } else {
        rootfs
            .join(workdir.trim_start_matches('/'))
            .join(argv0)
    };

    if candidate.is_file() {
        return Ok(candidate);
    }

    Err(StrataError::MissingDependencyFailure(format!(
        "entrypoint '{argv0}' not found in image"
    )))
}
