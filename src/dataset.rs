//! Discovery and loading of per-year dataset shards.
//!
//! Each shard is a JSON array of normalized records. Loading is lenient:
//! a shard that cannot be read or parsed is reported and skipped, and so is
//! an array entry that is not a record. Nothing is dropped silently; the
//! [`LoadReport`] carries what was skipped and why.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    extract::{Document, extract},
};

/// File name pattern of the per-year shards.
pub const DEFAULT_SHARD_PATTERN: &str = "cve_cwe_dataset_*.json";

/// Outcome of scanning a dataset directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    /// Shards that were skipped, with the reason.
    pub skipped_files: Vec<(PathBuf, String)>,
    /// Array entries that were not JSON objects.
    pub skipped_records: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped_files.is_empty() && self.skipped_records == 0
    }
}

/// List the shard files in `dir` matching `pattern`, sorted by file name.
///
/// The scan is not recursive. Hidden files are skipped.
pub fn discover_shards(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound {
            kind: "dataset directory",
            name: dir.display().to_string(),
        });
    }

    let matcher = globset::Glob::new(pattern)
        .map_err(|e| Error::Config(format!("invalid shard pattern: {e}")))?
        .compile_matcher();

    let mut shards = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }
        // Follows symlinks, so a linked shard is picked up too.
        if !entry.path().is_file() {
            continue;
        }
        if matcher.is_match(name.as_ref()) {
            shards.push(entry.path());
        }
    }

    shards.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(shards)
}

/// Load every default-pattern shard in `dir` into documents.
pub fn load_documents(dir: &Path) -> Result<LoadReport> {
    load_documents_matching(dir, DEFAULT_SHARD_PATTERN)
}

pub fn load_documents_matching(dir: &Path, pattern: &str) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    for shard in discover_shards(dir, pattern)? {
        let records = match read_shard(&shard) {
            Ok(records) => records,
            Err(reason) => {
                warn!(shard = %shard.display(), %reason, "skipping shard");
                report.skipped_files.push((shard, reason));
                continue;
            }
        };

        let before = report.documents.len();
        for record in records {
            if record.is_object() {
                report.documents.push(extract(&record));
            } else {
                report.skipped_records += 1;
            }
        }
        debug!(
            shard = %shard.display(),
            documents = report.documents.len() - before,
            "loaded shard"
        );
    }

    if report.skipped_records > 0 {
        warn!(
            count = report.skipped_records,
            "skipped dataset entries that are not records"
        );
    }

    Ok(report)
}

/// Parse one shard. Errors come back as a human-readable reason.
fn read_shard(path: &Path) -> std::result::Result<Vec<Value>, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("unreadable: {e}"))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(_) => Err("top-level value is not an array".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}
