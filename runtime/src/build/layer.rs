//! Layer model: chained content digests, filesystem snapshots, and
//! deterministic tar.gz payloads.
//!
//! A layer digest is a sha256 chained over (parent digest, canonical
//! instruction line, referenced file contents). Identical inputs at the
//! same stack position always produce the same digest, and that digest is the cache
//! key. Payloads are written with sorted entries and zeroed timestamps so
//! identical inputs also produce byte-identical archives.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use strata_core::error::{Result, StrataError};

/// A layer payload written to disk.
#[derive(Debug, Clone)]
pub struct LayerPayload {
    /// Path to the tar.gz archive
    pub path: PathBuf,
    /// Archive size in bytes
    pub size: u64,
}

/// Compute the chained digest for one build step.
///
/// `parent` is the previous step's digest (`None` for the first step),
/// `canonical` the instruction's canonical line, and `fingerprint` the
/// digest input derived from referenced file contents (empty for steps
/// that reference no context files).
pub fn chain_digest(parent: Option<&str>, canonical: &str, fingerprint: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or(""));
    hasher.update([0u8]);
    hasher.update(canonical);
    hasher.update([0u8]);
    hasher.update(fingerprint);
    hex::encode(hasher.finalize())
}

/// sha256 of raw bytes as a hex string.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// sha256 of a file's contents as a hex string.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        StrataError::BuildError(format!("Failed to open {} for hashing: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            StrataError::BuildError(format!("Failed to read {} for hashing: {}", path.display(), e))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint of referenced files: (label, content hash) pairs in label
/// order, so glob expansion order never leaks into the digest.
pub fn fingerprint_files(files: &[(String, PathBuf)]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&(String, PathBuf)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    for (label, path) in sorted {
        out.extend_from_slice(label.as_bytes());
        out.push(0);
        out.extend_from_slice(sha256_file(path)?.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

/// Metadata for one file in a snapshot.
#[derive(Debug, Clone, PartialEq)]
struct FileEntry {
    size: u64,
    mtime: i64,
    is_dir: bool,
}

/// A snapshot of a directory tree's file state, used to diff the rootfs
/// before and after a build step.
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    entries: BTreeMap<PathBuf, FileEntry>,
}

impl DirSnapshot {
    /// Record every entry under `root` with size and mtime.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        collect_entries(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Paths added or modified between `self` (before) and `after`,
    /// sorted for deterministic layer assembly.
    pub fn diff(&self, after: &DirSnapshot) -> Vec<PathBuf> {
        after
            .entries
            .iter()
            .filter(|(path, entry)| match self.entries.get(*path) {
                None => true,
                Some(before) => before.size != entry.size || before.mtime != entry.mtime,
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn collect_entries(
    root: &Path,
    current: &Path,
    entries: &mut BTreeMap<PathBuf, FileEntry>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StrataError::BuildError(format!("Failed to read {}: {}", current.display(), e))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| StrataError::BuildError(format!("Failed to read directory entry: {e}")))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                StrataError::BuildError(format!(
                    "Path {} escapes snapshot root: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            StrataError::BuildError(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let is_dir = metadata.is_dir();
        entries.insert(
            relative,
            FileEntry {
                size: metadata.len(),
                mtime,
                is_dir,
            },
        );

        if is_dir {
            collect_entries(root, &path, entries)?;
        }
    }

    Ok(())
}

/// Write a tar.gz layer containing `changed` paths (relative to `rootfs`).
///
/// Entries are added in sorted order with zeroed mtime and uid/gid, so the
/// same set of file contents always yields the same archive bytes.
pub fn write_layer(rootfs: &Path, changed: &[PathBuf], output: &Path) -> Result<LayerPayload> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let file = std::fs::File::create(output).map_err(|e| {
        StrataError::BuildError(format!(
            "Failed to create layer file {}: {}",
            output.display(),
            e
        ))
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut paths: Vec<&PathBuf> = changed.iter().collect();
    paths.sort();

    for relative in paths {
        let full = rootfs.join(relative);
        let metadata = match std::fs::symlink_metadata(&full) {
            Ok(m) => m,
            // Deleted between diff and archive: skip
            Err(_) => continue,
        };
        append_entry(&mut builder, relative, &full, &metadata)?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| StrataError::BuildError(format!("Failed to finalize layer archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| StrataError::BuildError(format!("Failed to finish layer compression: {e}")))?;

    let size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
    Ok(LayerPayload {
        path: output.to_path_buf(),
        size,
    })
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    relative: &Path,
    full: &Path,
    metadata: &std::fs::Metadata,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(metadata.permissions().mode() & 0o7777);

    let describe =
        |e| StrataError::BuildError(format!("Failed to add {} to layer: {}", relative.display(), e));

    if metadata.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, relative, std::io::empty())
            .map_err(describe)?;
    } else if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(full).map_err(describe)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, relative, &target)
            .map_err(describe)?;
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        let file = std::fs::File::open(full).map_err(describe)?;
        builder
            .append_data(&mut header, relative, file)
            .map_err(describe)?;
    }

    Ok(())
}

/// Extract a layer archive (tar.gz) into `target_dir`.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    use flate2::read::GzDecoder;

    if !layer_path.exists() {
        return Err(StrataError::BuildError(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        StrataError::BuildError(format!(
            "Failed to create extraction target {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = std::fs::File::open(layer_path).map_err(|e| {
        StrataError::BuildError(format!(
            "Failed to open layer {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_mtime(false);
    archive.unpack(target_dir).map_err(|e| {
        StrataError::BuildError(format!(
            "Failed to extract layer into {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}
