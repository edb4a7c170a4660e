//! Checkpoint persistence for resumable target runs.
//!
//! Each target owns one JSON state file and one advisory lock file under the
//! checkpoint directory, both named by a digest of the target key so keys
//! containing `:` stay filesystem-safe. Saves are atomic: a crash between
//! write and rename leaves the previous state intact.

pub mod lock;

pub use lock::TargetLock;

use crate::constants::CHECKPOINT_VERSION;
use crate::error::{LoaderError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Frozen iterator position, persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Schema version; mismatches invalidate the record.
    pub version: String,
    /// Page whose contents are (partially) consumed.
    pub page: u32,
    /// Server-side cursor for that page, when the feed uses one.
    pub cursor: Option<String>,
    /// Every mid already yielded, sorted.
    pub seen_mids: Vec<String>,
    /// Digest of the run options that affect which posts are yielded.
    pub options_hash: String,
    /// RFC 3339 time of the last iterator advance.
    pub timestamp: Option<String>,
}

/// Stateless store of per-target checkpoint files and locks.
pub struct CheckpointStore {
    dir: PathBuf,
    options_hash: String,
}

impl CheckpointStore {
    /// Open (and create) the store rooted at `dir`. Loaded records must
    /// match `options_hash` or they are treated as absent.
    pub fn new(dir: impl Into<PathBuf>, options_hash: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            LoaderError::Checkpoint(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            options_hash: options_hash.into(),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(target_key: &str) -> String {
        let digest = Sha256::digest(target_key.as_bytes());
        digest.iter().take(8).fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }

    /// Path of the state file for a target.
    pub fn state_path(&self, target_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(target_key)))
    }

    /// Path of the lock file for a target.
    pub fn lock_path(&self, target_key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", Self::file_stem(target_key)))
    }

    /// Acquire the exclusive per-target lock, failing fast on contention.
    pub fn lock(&self, target_key: &str) -> Result<TargetLock> {
        TargetLock::try_acquire(&self.lock_path(target_key))
    }

    /// Load the checkpoint for a target. Corrupt records and version or
    /// options-hash mismatches are reported and treated as absent.
    pub fn load(&self, target_key: &str) -> Option<CursorState> {
        let path = self.state_path(target_key);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target_key, error = %e, "cannot read checkpoint");
                return None;
            }
        };

        let state: CursorState = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(e) => {
                warn!(target_key, error = %e, "corrupt checkpoint discarded");
                return None;
            }
        };

        if state.version != CHECKPOINT_VERSION {
            warn!(
                target_key,
                found = %state.version,
                expected = CHECKPOINT_VERSION,
                "checkpoint version mismatch, starting fresh"
            );
            return None;
        }
        if state.options_hash != self.options_hash {
            warn!(target_key, "checkpoint options changed, starting fresh");
            return None;
        }

        Some(state)
    }

    /// Atomically persist the checkpoint for a target: temp file in the same
    /// directory, fsync, then rename over the destination.
    pub fn save(&self, target_key: &str, state: &CursorState) -> Result<()> {
        let path = self.state_path(target_key);
        let json = serde_json::to_string(state)
            .map_err(|e| LoaderError::Checkpoint(format!("serialize: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| LoaderError::Checkpoint(format!("temp file: {e}")))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| LoaderError::Checkpoint(format!("write: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| LoaderError::Checkpoint(format!("fsync: {e}")))?;
        tmp.persist(&path)
            .map_err(|e| LoaderError::Checkpoint(format!("rename: {e}")))?;

        debug!(target_key, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    /// Remove the state file after a target completes cleanly, so the next
    /// run starts from the first page again. Missing files are fine.
    pub fn clear(&self, target_key: &str) -> Result<()> {
        let path = self.state_path(target_key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(target_key, path = %path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LoaderError::Checkpoint(format!(
                "cannot remove {}: {e}",
                path.display()
            ))),
        }
    }
}
