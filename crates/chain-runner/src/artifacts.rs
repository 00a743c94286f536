//! Filesystem helpers shared by validation, dispatch and the run summary.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Writes `value` to a fresh `<prefix>XXXXXX.json` file in `dir` and keeps it
/// on disk; the returned path is unique for the lifetime of the directory.
pub fn write_temp_json(dir: &Path, prefix: &str, value: &Value) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".json")
        .tempfile_in(dir)?;
    serde_json::to_writer_pretty(file.as_file_mut(), value)?;
    file.as_file_mut().sync_all()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Reserves a unique `<prefix>XXXXXX` name in `dir` by creating an empty
/// marker file there. Names derived from it cannot collide with another
/// reservation in the same directory.
pub fn reserve_unique_name(dir: &Path, prefix: &str) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let marker = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    let (_, path) = marker.keep().map_err(|e| e.error)?;
    Ok(path)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

// serde_json maps are ordered by key, so serialization is already canonical.
pub fn canonical_json_digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&bytes))
}
