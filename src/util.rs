//! Shared persistence and text helpers.
//!
//! Whole-file writes go through a temp file in the target directory followed
//! by fsync and rename, so readers see either the old or the new document.
use crate::error::{GateError, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Digest;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn truncate_bytes(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    truncate_string(&text, max_bytes)
}

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Current epoch time in milliseconds for record timestamps.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or_default()
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| GateError::io(path, err))
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| GateError::Config(format!("{} has no parent", path.display())))?;
    ensure_dir(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|err| GateError::io(parent, err))?;
    temp.write_all(bytes)
        .map_err(|err| GateError::io(temp.path(), err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| GateError::io(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| GateError::io(path, err.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|err| GateError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("serialize: {err}"),
    })?;
    write_atomic(path, text.as_bytes())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(GateError::io(path, err)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|err| GateError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(Some(value))
}

/// Read a JSON document, falling back to `T::default()` when absent.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    Ok(read_json_optional(path)?.unwrap_or_default())
}

/// Run `f` while holding an exclusive advisory lock on `lock_path`.
///
/// The lock is released when the file handle drops, including on panic.
pub fn with_exclusive_lock<T>(lock_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|err| GateError::io(lock_path, err))?;
    file.lock_exclusive()
        .map_err(|err| GateError::io(lock_path, err))?;
    let result = f();
    // Unlock errors are not actionable; the handle drop releases it anyway.
    let _ = FileExt::unlock(&file);
    result
}

/// Append a JSON line to `path`.
pub fn append_jsonl<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| GateError::io(path, err))?;
    let mut line = serde_json::to_string(entry).map_err(|err| GateError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("serialize: {err}"),
    })?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .map_err(|err| GateError::io(path, err))?;
    Ok(())
}
