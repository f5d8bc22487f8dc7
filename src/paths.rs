//! Typed paths into the gate store layout.
//!
//! Centralizing path construction keeps file access consistent across the
//! components and keeps the on-disk format in one place.
use std::path::{Path, PathBuf};

/// Default store directory name under the repository root.
pub const DEFAULT_STORE_DIR: &str = ".vgate";

/// Convenience wrapper for locating store artifacts.
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    /// Create a new path helper rooted at the store root.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Return the store root used for path derivation.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `config.json` path.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Return the `catalog.json` path.
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    /// Return the `registry/` directory path.
    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn counters_path(&self) -> PathBuf {
        self.registry_dir().join("counters.json")
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.registry_dir().join("requirements.json")
    }

    pub fn checklist_path(&self) -> PathBuf {
        self.registry_dir().join("checklist.json")
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.registry_dir().join("mapping.json")
    }

    /// Advisory lock serializing registry writers.
    pub fn registry_lock_path(&self) -> PathBuf {
        self.registry_dir().join("registry.lock")
    }

    /// Return the `evidence/` directory path.
    pub fn evidence_dir(&self) -> PathBuf {
        self.root.join("evidence")
    }

    pub fn evidence_path(&self, id: &str) -> PathBuf {
        self.evidence_dir().join(format!("{id}.json"))
    }

    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.evidence_dir().join("artifacts").join(format!("{id}.bin"))
    }

    /// Return the `cache/` directory path.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn cache_index_path(&self) -> PathBuf {
        self.cache_dir().join("index.json")
    }

    pub fn cache_stats_path(&self) -> PathBuf {
        self.cache_dir().join("stats.json")
    }

    pub fn cache_entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir().join("entries").join(format!("{key}.json"))
    }

    pub fn cache_key_lock_path(&self, key: &str) -> PathBuf {
        self.cache_dir().join("locks").join(format!("{key}.lock"))
    }

    /// Lock for index and stats read-modify-write cycles.
    pub fn cache_index_lock_path(&self) -> PathBuf {
        self.cache_dir().join("locks").join("index.lock")
    }

    /// Return the `lock/` directory path.
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// The single lock record; its presence encodes the current holder.
    pub fn lock_record_path(&self) -> PathBuf {
        self.lock_dir().join("merge.json")
    }

    pub fn lock_guard_path(&self) -> PathBuf {
        self.lock_dir().join("guard.lock")
    }

    pub fn lock_queue_dir(&self) -> PathBuf {
        self.lock_dir().join("queue")
    }

    pub fn lock_ticket_counter_path(&self) -> PathBuf {
        self.lock_dir().join("ticket_counter.json")
    }

    /// Return the `lock/audit.jsonl` path.
    pub fn lock_audit_path(&self) -> PathBuf {
        self.lock_dir().join("audit.jsonl")
    }
}
