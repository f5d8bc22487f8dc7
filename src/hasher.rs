//! Content hashing for declared check inputs.
//!
//! The digest covers logical paths and file bytes only. Inputs are sorted by
//! logical path first, so enumeration order and filesystem metadata never
//! change the result.
use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A declared input: a stable logical name plus where to read it from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub logical: String,
    pub path: PathBuf,
}

impl FileRef {
    pub fn new(logical: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            logical: normalize_logical(&logical.into()),
            path: path.into(),
        }
    }

    /// Build a ref for `rel` resolved under `root`.
    pub fn under(root: &Path, rel: &str) -> Self {
        let logical = normalize_logical(rel);
        let path = root.join(&logical);
        Self { logical, path }
    }
}

/// Hex-encoded SHA-256 over a sorted input set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a set of inputs deterministically.
///
/// Fails with `InputUnreadable` on the first input that cannot be read; the
/// caller must treat that as "never cache".
pub fn hash_files(files: &[FileRef]) -> Result<ContentDigest> {
    let mut sorted: Vec<&FileRef> = files.iter().collect();
    sorted.sort_by(|a, b| a.logical.cmp(&b.logical));
    sorted.dedup_by(|a, b| a.logical == b.logical);

    let mut hasher = Sha256::new();
    for file in sorted {
        let bytes = fs::read(&file.path).map_err(|source| GateError::InputUnreadable {
            path: file.path.clone(),
            source,
        })?;
        hasher.update(b"file:");
        hasher.update(file.logical.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
    }
    Ok(ContentDigest(format!("{:x}", hasher.finalize())))
}

fn normalize_logical(raw: &str) -> String {
    let replaced = raw.replace('\\', "/");
    let trimmed = replaced.trim_start_matches("./");
    trimmed.to_string()
}
