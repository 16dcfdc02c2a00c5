//! State management for container instances.
//!
//! Persists container metadata to `~/.strata/containers.json` with atomic
//! writes. On every load, dead PIDs are reconciled so `ps` and `stop`
//! never act on processes that no longer exist.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_runtime::runner::pid_alive;

/// Metadata record for a single container instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Full UUID
    pub id: String,
    /// First 12 hex chars of the UUID (no dashes)
    pub short_id: String,
    /// User-assigned or auto-generated name
    pub name: String,
    /// Image reference
    pub image: String,
    /// "running" | "exited"
    pub status: String,
    /// Entrypoint process PID (set while running)
    pub pid: Option<u32>,
    /// Port mappings ("host:container" pairs)
    pub ports: Vec<String>,
    /// Per-container rootfs path
    pub rootfs: PathBuf,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Whether to remove the record and rootfs on exit
    pub auto_remove: bool,
}

impl ContainerRecord {
    /// Generate a short ID from a full UUID (first 12 hex characters, no dashes).
    pub fn make_short_id(id: &str) -> String {
        id.replace('-', "").chars().take(12).collect()
    }
}

/// Persistent state file backed by JSON.
pub struct StateFile {
    path: PathBuf,
    records: Vec<ContainerRecord>,
}

impl StateFile {
    /// Load state from disk. Creates an empty state if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let records: Vec<ContainerRecord> = serde_json::from_str(&data).unwrap_or_default();
            let mut sf = Self {
                path: path.to_path_buf(),
                records,
            };
            sf.reconcile();
            Ok(sf)
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Self {
                path: path.to_path_buf(),
                records: Vec::new(),
            })
        }
    }

    /// Load from the configured default path.
    pub fn load_default() -> Result<Self, std::io::Error> {
        let config = strata_core::config::StrataConfig::default();
        Self::load(&config.state_file())
    }

    /// Save state to disk atomically (write to .tmp, then rename).
    pub fn save(&self) -> Result<(), std::io::Error> {
        let data = serde_json::to_string_pretty(&self.records).map_err(std::io::Error::other)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Add a record and persist.
    pub fn add(&mut self, record: ContainerRecord) -> Result<(), std::io::Error> {
        self.records.push(record);
        self.save()
    }

    /// Remove a record by ID and persist.
    pub fn remove(&mut self, id: &str) -> Result<bool, std::io::Error> {
        let len_before = self.records.len();
        self.records.retain(|r| r.id != id);
        if self.records.len() < len_before {
            self.save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// All records.
    pub fn records(&self) -> &[ContainerRecord] {
        &self.records
    }

    /// Find a mutable record by exact ID.
    pub fn find_by_id_mut(&mut self, id: &str) -> Option<&mut ContainerRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Resolve a name, exact ID, or unambiguous ID prefix to one record.
    pub fn resolve(&self, needle: &str) -> Option<&ContainerRecord> {
        if let Some(record) = self.records.iter().find(|r| r.name == needle || r.id == needle) {
            return Some(record);
        }
        let matches: Vec<&ContainerRecord> = self
            .records
            .iter()
            .filter(|r| r.id.starts_with(needle) || r.short_id.starts_with(needle))
            .collect();
        match matches.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }

    /// Mark records whose PID no longer exists as exited.
    fn reconcile(&mut self) {
        let mut changed = false;
        for record in &mut self.records {
            if record.status == "running" {
                let alive = record.pid.map(pid_alive).unwrap_or(false);
                if !alive {
                    record.status = "exited".to_string();
                    record.pid = None;
                    changed = true;
                }
            }
        }
        if changed {
            let _ = self.save();
        }
    }
}

/// Generate a readable container name like "brisk-harbor".
pub fn generate_name() -> String {
    use rand::seq::SliceRandom;

    const ADJECTIVES: &[&str] = &[
        "brisk", "calm", "eager", "fond", "keen", "merry", "noble", "quick", "spry", "warm",
    ];
    const NOUNS: &[&str] = &[
        "anchor", "beacon", "cove", "drift", "harbor", "jetty", "lagoon", "quay", "reef", "tide",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        ADJECTIVES.choose(&mut rng).unwrap_or(&"swift"),
        NOUNS.choose(&mut rng).unwrap_or(&"harbor")
    )
}
