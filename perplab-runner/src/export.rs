//! Artifact I/O: JSON documents, CSV tables, descriptor collections.
//!
//! Writes go through a sibling `*.tmp` file and a rename, so a reader never
//! sees a half-written artifact. Optional inputs are read as
//! `Result<Option<T>>`: a missing file is `Ok(None)`, a malformed one is an
//! error.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use perplab_core::domain::{RawDescriptor, StrategyDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

/// Replace `path` with `bytes` via write-to-temp and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
    Ok(())
}

// ─── JSON ───────────────────────────────────────────────────────────

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    write_atomic(path, json.as_bytes())
}

/// Read a JSON document that may legitimately be absent.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&text)
        .with_context(|| format!("malformed JSON in {}", path.display()))?;
    Ok(Some(value))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    read_json_opt(path)?.with_context(|| format!("{} does not exist", path.display()))
}

// ─── CSV ────────────────────────────────────────────────────────────

/// Serialize `rows` as CSV with a header row.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for row in rows {
        wtr.serialize(row)?;
    }
    let bytes = wtr.into_inner().context("failed to flush CSV buffer")?;
    write_atomic(path, &bytes)
}

pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for (i, row) in rdr.deserialize().enumerate() {
        out.push(row.with_context(|| format!("bad row {} in {}", i + 1, path.display()))?);
    }
    Ok(out)
}

// ─── Descriptor collections ─────────────────────────────────────────

/// Load a JSON array of descriptor records, validating each one.
pub fn load_descriptors(path: &Path) -> Result<Vec<StrategyDescriptor>> {
    let raw: Vec<RawDescriptor> = read_json(path)?;
    raw.into_iter()
        .enumerate()
        .map(|(i, r)| {
            StrategyDescriptor::try_from(r)
                .with_context(|| format!("invalid descriptor #{i} in {}", path.display()))
        })
        .collect()
}

pub fn save_descriptors(path: &Path, descriptors: &[StrategyDescriptor]) -> Result<()> {
    write_json(path, descriptors)
}
