//! Build step execution.
//!
//! `StepExecutor` is the seam between the build engine and the host: the
//! engine decides *what* runs and the executor decides *how*. The
//! production executor chroots into the rootfs and drops to the step's
//! user; the host executor runs against the rootfs without chroot for
//! unprivileged development hosts. Neither will silently run a step as an
//! identity other than the configured one.

use std::path::Path;
use std::process::Command;

use strata_core::error::{Result, StrataError};

/// Default PATH inside the build rootfs.
const BUILD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One step's execution request.
#[derive(Debug)]
pub struct ExecRequest<'a> {
    /// Rootfs the step runs against
    pub rootfs: &'a Path,
    /// Shell command (`/bin/sh -c` semantics)
    pub command: &'a str,
    /// Resolved identity for the step; `None` runs as the builder itself
    pub identity: Option<(u32, u32)>,
    /// Working directory inside the image (absolute)
    pub workdir: &'a str,
    /// Environment variables
    pub env: &'a [(String, String)],
}

/// Captured output of an executed step.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code (-1 when terminated by signal)
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Whether the failure looks like a privilege problem rather than an
    /// ordinary command failure.
    pub fn permission_denied(&self) -> bool {
        if self.code == 126 {
            return true;
        }
        let stderr = self.stderr_lossy().to_lowercase();
        stderr.contains("permission denied") || stderr.contains("operation not permitted")
    }
}

/// Executes one build step against a rootfs.
pub trait StepExecutor: Send + Sync {
    /// Whether this executor can run a step as the given uid.
    fn can_run_as(&self, uid: u32) -> bool;

    /// Execute the step and capture its output. A non-zero exit is an
    /// `Ok(ExecOutput)`, not an `Err`; classification is the engine's job.
    fn execute(&self, req: &ExecRequest<'_>) -> Result<ExecOutput>;
}

/// Production executor: chroot into the rootfs, then drop to the step's
/// identity before exec. Requires root.
pub struct ChrootExecutor;

impl StepExecutor for ChrootExecutor {
    fn can_run_as(&self, uid: u32) -> bool {
        current_uid() == 0 || uid == current_uid()
    }

    fn execute(&self, req: &ExecRequest<'_>) -> Result<ExecOutput> {
        use std::os::unix::process::CommandExt;

        let rootfs = req.rootfs.to_path_buf();
        let workdir = req.workdir.to_string();
        let identity = req.identity;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(req.command);
        apply_env(&mut cmd, req.env);

        // chroot, chdir, and setuid must all happen in the child, in this
        // order: privileges are needed for chroot itself.
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

        run_captured(cmd, req.command)
    }
}

/// Development executor: runs the step with the rootfs-joined workdir as
/// cwd and no chroot. Refuses identities it cannot adopt rather than
/// running as the wrong one.
pub struct HostExecutor;

impl StepExecutor for HostExecutor {
    fn can_run_as(&self, uid: u32) -> bool {
        uid == current_uid()
    }

    fn execute(&self, req: &ExecRequest<'_>) -> Result<ExecOutput> {
        let cwd = req.rootfs.join(req.workdir.trim_start_matches('/'));
        std::fs::create_dir_all(&cwd).map_err(|e| {
            StrataError::BuildError(format!(
                "Failed to create workdir {}: {}",
                cwd.display(),
                e
            ))
        })?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(req.command).current_dir(&cwd);
        apply_env(&mut cmd, req.env);

        run_captured(cmd, req.command)
    }
}

/// Pick the executor for this host: chroot when running as root on Linux,
/// the host executor otherwise.
pub fn default_executor() -> Box<dyn StepExecutor> {
    if cfg!(target_os = "linux") && current_uid() == 0 {
        Box::new(ChrootExecutor)
    } else {
        tracing::debug!("not running as root, using host executor without chroot");
        Box::new(HostExecutor)
    }
}

fn apply_env(cmd: &mut Command, env: &[(String, String)]) {
    cmd.env_clear();
    cmd.env("PATH", BUILD_PATH);
    cmd.env("HOME", "/root");
    for (key, value) in env {
        cmd.env(key, value);
    }
}

fn run_captured(mut cmd: Command, command: &str) -> Result<ExecOutput> {
    let output = cmd
        .output()
        .map_err(|e| StrataError::BuildError(format!("Failed to spawn '{command}': {e}")))?;
    Ok(ExecOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Current effective uid of the builder process.
pub fn current_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Resolve a USER argument to a (uid, gid) pair.
///
/// Numeric users pass through directly; names are looked up in the
/// rootfs's `/etc/passwd`.
pub fn resolve_user(rootfs: &Path, user: &str) -> Result<(u32, u32)> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok((uid, uid));
    }

    let passwd_path = rootfs.join("etc/passwd");
    let passwd = std::fs::read_to_string(&passwd_path).map_err(|e| {
        StrataError::BuildError(format!(
            "USER '{}': cannot read {}: {}",
            user,
            passwd_path.display(),
            e
        ))
    })?;

    for line in passwd.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(user) {
            continue;
        }
        // name:password:uid:gid:...
        let uid = fields.nth(1).and_then(|f| f.parse::<u32>().ok());
        let gid = fields.next().and_then(|f| f.parse::<u32>().ok());
        if let (Some(uid), Some(gid)) = (uid, gid) {
            return Ok((uid, gid));
        }
    }

    Err(StrataError::BuildError(format!(
        "USER '{user}' not found in image /etc/passwd"
    )))
}
