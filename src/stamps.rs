//! Latest-post stamps for incremental updates.
//!
//! When `--latest-stamps <path>` is active, each target records the newest
//! `created_at` it has fully processed; the next run stops at that cutoff.
//! The file is rewritten atomically and only when its content changed.

use crate::error::{LoaderError, Result};
use chrono::{DateTime, FixedOffset};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Map of `target_key` to the newest processed post timestamp (CST).
pub struct LatestStamps {
    path: Option<PathBuf>,
    map: BTreeMap<String, DateTime<FixedOffset>>,
    saved_payload: Option<String>,
}

impl LatestStamps {
    /// Load the stamps file, or an inert no-op store when no path is set.
    pub fn load(path: Option<PathBuf>) -> Self {
        let map = match &path {
            Some(p) => read_map(p),
            None => BTreeMap::new(),
        };
        let saved_payload = serialize(&map).ok();
        Self {
            path,
            map,
            saved_payload,
        }
    }

    /// Cutoff timestamp for a target, when one is recorded.
    pub fn get(&self, target_key: &str) -> Option<DateTime<FixedOffset>> {
        self.map.get(target_key).copied()
    }

    /// Record the newest processed timestamp for a target.
    pub fn record(&mut self, target_key: &str, timestamp: DateTime<FixedOffset>) {
        self.map
            .insert(target_key.to_string(), timestamp.with_timezone(&crate::cst()));
    }

    /// Atomically rewrite the stamps file when its content changed. A store
    /// without a path is a no-op.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let payload = serialize(&self.map)?;
        if self.saved_payload.as_deref() == Some(payload.as_str()) {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LoaderError::Checkpoint(format!("stamps dir: {e}")))?;
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| LoaderError::Checkpoint(format!("stamps temp file: {e}")))?;
        tmp.write_all(payload.as_bytes())
            .map_err(|e| LoaderError::Checkpoint(format!("stamps write: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| LoaderError::Checkpoint(format!("stamps fsync: {e}")))?;
        tmp.persist(&path)
            .map_err(|e| LoaderError::Checkpoint(format!("stamps rename: {e}")))?;

        self.saved_payload = Some(payload);
        debug!(path = %path.display(), "stamps saved");
        Ok(())
    }
}

fn read_map(path: &Path) -> BTreeMap<String, DateTime<FixedOffset>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "cannot read stamps");
            }
            return BTreeMap::new();
        }
    };
    let raw: BTreeMap<String, String> = match serde_json::from_str(&contents) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt stamps file ignored");
            return BTreeMap::new();
        }
    };
    raw.into_iter()
        .filter_map(|(key, value)| {
            DateTime::parse_from_rfc3339(&value)
                .ok()
                .map(|ts| (key, ts.with_timezone(&crate::cst())))
        })
        .collect()
}

fn serialize(map: &BTreeMap<String, DateTime<FixedOffset>>) -> Result<String> {
    let raw: BTreeMap<&str, String> = map
        .iter()
        .map(|(key, ts)| (key.as_str(), ts.to_rfc3339()))
        .collect();
    serde_json::to_string_pretty(&raw)
        .map_err(|e| LoaderError::Checkpoint(format!("stamps serialize: {e}")))
}
