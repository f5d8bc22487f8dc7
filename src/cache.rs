//! Content-addressed check result cache.
//!
//! Entries are keyed by `(check name, command, content hash of declared
//! inputs)`; the command is optional for callers that only know the name. The
//! cache is conservative: anything unexpected (unreadable inputs, a future
//! timestamp, a blob that disagrees with its key) is a miss, never a stale hit.
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::hasher::{hash_files, ContentDigest, FileRef};
use crate::paths::StorePaths;
use crate::util::{
    duration_ms, now_epoch_ms, read_json_optional, read_json_or_default, sha256_hex,
    truncate_string, with_exclusive_lock, write_json_atomic,
};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// One stored verdict, written whole and replaced whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub check: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub hash: ContentDigest,
    pub outcome_code: i32,
    pub output_sample: String,
    pub created_at_epoch_ms: u64,
    pub ttl_ms: u64,
    pub files: Vec<FileRef>,
}

impl CacheEntry {
    pub fn expires_at_epoch_ms(&self) -> u64 {
        self.created_at_epoch_ms.saturating_add(self.ttl_ms)
    }
}

/// Verdict returned on a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedOutcome {
    pub code: i32,
    pub output_sample: String,
    pub hash: ContentDigest,
    pub created_at_epoch_ms: u64,
}

/// Why a lookup did not produce a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MissReason {
    Bypassed,
    Absent,
    Expired,
    ClockSkew,
    InputsChanged,
    InputUnreadable { path: String },
    Corrupt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CacheLookup {
    Hit(CachedOutcome),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Index row pointing at an entry blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub check: String,
    pub hash: ContentDigest,
    pub created_at_epoch_ms: u64,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<String, IndexRow>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    #[serde(default)]
    hits: u64,
    #[serde(default)]
    misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Handle onto `cache/` in a gate store.
#[derive(Debug, Clone)]
pub struct CheckCache {
    paths: StorePaths,
    output_sample_bytes: usize,
    clock_skew_tolerance: Duration,
    command: Option<String>,
}

impl CheckCache {
    pub fn new(paths: StorePaths, config: &GateConfig) -> Self {
        Self {
            paths,
            output_sample_bytes: config.output_sample_bytes,
            clock_skew_tolerance: config.clock_skew_tolerance,
            command: None,
        }
    }

    /// Key entries on `command` as well, so editing a check's command never
    /// serves a verdict produced by the old one.
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    /// Look up the cached verdict for `check` over `files`.
    ///
    /// `bypass` forces a miss for operator-triggered full reruns.
    pub fn lookup(&self, check: &str, files: &[FileRef], bypass: bool) -> Result<CacheLookup> {
        let result = self.lookup_inner(check, files, bypass)?;
        match &result {
            CacheLookup::Hit(outcome) => {
                tracing::info!(check, hash = %outcome.hash, "cache hit");
            }
            CacheLookup::Miss(reason) => {
                tracing::debug!(check, ?reason, "cache miss");
            }
        }
        self.record(result.is_hit())?;
        Ok(result)
    }

    fn lookup_inner(&self, check: &str, files: &[FileRef], bypass: bool) -> Result<CacheLookup> {
        if bypass {
            return Ok(CacheLookup::Miss(MissReason::Bypassed));
        }
        let hash = match hash_files(files) {
            Ok(hash) => hash,
            Err(GateError::InputUnreadable { path, source }) => {
                tracing::warn!(check, path = %path.display(), %source, "input unreadable; treating as miss");
                return Ok(CacheLookup::Miss(MissReason::InputUnreadable {
                    path: path.display().to_string(),
                }));
            }
            Err(err) => return Err(err),
        };
        let key = entry_key(check, self.command.as_deref(), &hash);
        let entry: CacheEntry = match read_json_optional(&self.paths.cache_entry_path(&key)) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(CacheLookup::Miss(MissReason::Absent)),
            Err(GateError::Corrupt { path, reason }) => {
                tracing::warn!(check, path = %path.display(), %reason, "corrupt cache entry");
                return Ok(CacheLookup::Miss(MissReason::Corrupt));
            }
            Err(err) => return Err(err),
        };
        if entry.schema_version != CACHE_SCHEMA_VERSION
            || entry.check != check
            || entry.command != self.command
            || entry.hash != hash
        {
            return Ok(CacheLookup::Miss(MissReason::Corrupt));
        }
        let now = now_epoch_ms();
        let skew_ms = duration_ms(self.clock_skew_tolerance);
        if entry.created_at_epoch_ms > now.saturating_add(skew_ms) {
            return Ok(CacheLookup::Miss(MissReason::ClockSkew));
        }
        if now >= entry.expires_at_epoch_ms() {
            return Ok(CacheLookup::Miss(MissReason::Expired));
        }
        match hash_files(&entry.files) {
            Ok(current) if current == entry.hash => {}
            _ => return Ok(CacheLookup::Miss(MissReason::InputsChanged)),
        }
        Ok(CacheLookup::Hit(CachedOutcome {
            code: entry.outcome_code,
            output_sample: entry.output_sample,
            hash: entry.hash,
            created_at_epoch_ms: entry.created_at_epoch_ms,
        }))
    }

    /// Store a verdict, replacing any entry under the same key.
    ///
    /// Fails with `InputUnreadable` when the inputs cannot be hashed; nothing
    /// is written in that case.
    pub fn store(
        &self,
        check: &str,
        files: &[FileRef],
        outcome_code: i32,
        output_sample: &str,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let hash = hash_files(files)?;
        self.write_entry(check, files, hash, outcome_code, output_sample, ttl)
    }

    /// Store a verdict for inputs that hashed to `checked` before the check
    /// ran.
    ///
    /// Returns `None` and writes nothing when the inputs changed in the
    /// meantime, since the verdict then describes content that is gone.
    pub fn store_checked(
        &self,
        check: &str,
        files: &[FileRef],
        checked: &ContentDigest,
        outcome_code: i32,
        output_sample: &str,
        ttl: Duration,
    ) -> Result<Option<CacheEntry>> {
        let current = hash_files(files)?;
        if &current != checked {
            tracing::warn!(check, %checked, %current, "inputs changed while the check ran; not caching");
            return Ok(None);
        }
        self.write_entry(check, files, current, outcome_code, output_sample, ttl)
            .map(Some)
    }

    fn write_entry(
        &self,
        check: &str,
        files: &[FileRef],
        hash: ContentDigest,
        outcome_code: i32,
        output_sample: &str,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let key = entry_key(check, self.command.as_deref(), &hash);
        let mut sorted = files.to_vec();
        sorted.sort();
        sorted.dedup_by(|a, b| a.logical == b.logical);
        let entry = CacheEntry {
            schema_version: CACHE_SCHEMA_VERSION,
            check: check.to_string(),
            command: self.command.clone(),
            hash: hash.clone(),
            outcome_code,
            output_sample: truncate_string(output_sample, self.output_sample_bytes),
            created_at_epoch_ms: now_epoch_ms(),
            ttl_ms: duration_ms(ttl),
            files: sorted,
        };
        with_exclusive_lock(&self.paths.cache_key_lock_path(&key), || {
            write_json_atomic(&self.paths.cache_entry_path(&key), &entry)
        })?;
        self.with_index(|index| {
            index.entries.insert(
                key.clone(),
                IndexRow {
                    check: entry.check.clone(),
                    hash: entry.hash.clone(),
                    created_at_epoch_ms: entry.created_at_epoch_ms,
                    ttl_ms: entry.ttl_ms,
                },
            );
            Ok(())
        })?;
        tracing::info!(check, hash = %hash, code = outcome_code, "cache entry stored");
        Ok(entry)
    }

    /// Remove every entry whose check name matches a glob pattern.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        let matcher = Glob::new(pattern)
            .map_err(|err| GateError::Pattern {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            })?
            .compile_matcher();
        let removed = self.remove_where(|entry| matcher.is_match(&entry.check))?;
        tracing::info!(pattern, removed, "cache invalidated");
        Ok(removed)
    }

    /// Remove entries whose ttl has elapsed.
    pub fn prune(&self) -> Result<usize> {
        let now = now_epoch_ms();
        self.remove_where(|entry| now >= entry.expires_at_epoch_ms())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let stats: StatsFile = read_json_or_default(&self.paths.cache_stats_path())?;
        let total = stats.hits + stats.misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            stats.hits as f64 / total as f64
        };
        Ok(CacheStats {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate,
        })
    }

    /// Index rows ordered by check name then creation time.
    pub fn entries(&self) -> Result<Vec<IndexRow>> {
        let index: CacheIndex = read_json_or_default(&self.paths.cache_index_path())?;
        let mut rows: Vec<IndexRow> = index.entries.into_values().collect();
        rows.sort_by(|a, b| {
            a.check
                .cmp(&b.check)
                .then(a.created_at_epoch_ms.cmp(&b.created_at_epoch_ms))
        });
        Ok(rows)
    }

    fn record(&self, hit: bool) -> Result<()> {
        let path = self.paths.cache_stats_path();
        with_exclusive_lock(&self.paths.cache_index_lock_path(), || {
            let mut stats: StatsFile = read_json_or_default(&path)?;
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
            write_json_atomic(&path, &stats)
        })
    }

    fn with_index<T>(&self, f: impl FnOnce(&mut CacheIndex) -> Result<T>) -> Result<T> {
        let path = self.paths.cache_index_path();
        with_exclusive_lock(&self.paths.cache_index_lock_path(), || {
            let mut index: CacheIndex = read_json_or_default(&path)?;
            let value = f(&mut index)?;
            index.schema_version = CACHE_SCHEMA_VERSION;
            write_json_atomic(&path, &index)?;
            Ok(value)
        })
    }

    /// Scan entry blobs directly so blobs missing from the index are still
    /// found, then drop the matching index rows.
    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Result<usize> {
        let dir = self.paths.cache_dir().join("entries");
        self.with_index(|index| {
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(err) => return Err(GateError::io(&dir, err)),
            };
            let mut removed = 0;
            for dirent in listing {
                let path = dirent.map_err(|err| GateError::io(&dir, err))?.path();
                let Some(key) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .filter(|_| path.extension().is_some_and(|ext| ext == "json"))
                    .map(str::to_string)
                else {
                    continue;
                };
                let entry: CacheEntry = match read_json_optional(&path) {
                    Ok(Some(entry)) => entry,
                    Ok(None) => continue,
                    Err(GateError::Corrupt { .. }) => {
                        // Unparseable blobs can never hit; drop them.
                        remove_file_if_present(&path)?;
                        index.entries.remove(&key);
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                if predicate(&entry) {
                    with_exclusive_lock(&self.paths.cache_key_lock_path(&key), || {
                        remove_file_if_present(&path)
                    })?;
                    index.entries.remove(&key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

/// Blob key for `(check, command, hash)`.
pub fn entry_key(check: &str, command: Option<&str>, hash: &ContentDigest) -> String {
    let mut material = Vec::with_capacity(check.len() + hash.as_str().len() + 2);
    material.extend_from_slice(check.as_bytes());
    material.push(0);
    if let Some(command) = command {
        material.extend_from_slice(command.as_bytes());
        material.push(0);
    }
    material.extend_from_slice(hash.as_str().as_bytes());
    sha256_hex(&material)
}

fn remove_file_if_present(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(GateError::io(path, err)),
    }
}
