//! Streaming media downloads.
//!
//! One file at a time: skip when the destination already has content,
//! otherwise stream to `{dest}.part` in bounded chunks under a wall-clock
//! deadline, fsync, and rename into place. A failure of any kind leaves no
//! `.part` behind.

pub mod pool;

use crate::constants::{DOWNLOAD_CHUNK_SIZE, MEDIA_DOWNLOAD_TIMEOUT};
use crate::context::{RequestOptions, WeiboContext};
use crate::error::{LoaderError, Result};
use crate::events::MediaOutcome;
use crate::ratecontrol::Bucket;
use reqwest::Method;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of one [`MediaDownloader::download`] call.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// What happened.
    pub outcome: MediaOutcome,
    /// The destination path the call was made for.
    pub path: PathBuf,
}

/// Downloads single media files through the shared context.
pub struct MediaDownloader {
    ctx: Arc<WeiboContext>,
}

impl MediaDownloader {
    /// Create a downloader over a shared context.
    pub fn new(ctx: Arc<WeiboContext>) -> Self {
        Self { ctx }
    }

    /// Download `url` to `dest`.
    ///
    /// Returns `Skipped` without touching the network when `dest` already
    /// exists with size > 0. Any error, the wall-clock deadline included,
    /// yields `Failed` with the partial file removed.
    pub fn download(&self, url: &str, dest: &Path) -> DownloadResult {
        if let Ok(meta) = fs::metadata(dest) {
            if meta.len() > 0 {
                debug!(path = %dest.display(), "destination exists, skipping");
                return DownloadResult {
                    outcome: MediaOutcome::Skipped,
                    path: dest.to_path_buf(),
                };
            }
        }

        match self.fetch_to_part(url, dest) {
            Ok(()) => DownloadResult {
                outcome: MediaOutcome::Downloaded,
                path: dest.to_path_buf(),
            },
            Err(e) => {
                warn!(url, path = %dest.display(), error = %e, "media download failed");
                let _ = fs::remove_file(part_path(dest));
                DownloadResult {
                    outcome: MediaOutcome::Failed,
                    path: dest.to_path_buf(),
                }
            }
        }
    }

    fn fetch_to_part(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LoaderError::Target(format!("create {}: {e}", parent.display())))?;
        }

        // The deadline is fixed before any network traffic; the request's
        // total timeout backs it at the transport layer so even a trickling
        // server cannot stretch the download past it.
        let deadline = Instant::now() + MEDIA_DOWNLOAD_TIMEOUT;
        let opts = RequestOptions {
            bucket: Bucket::Media,
            allow_captcha: false,
            retries: 2,
            timeout: MEDIA_DOWNLOAD_TIMEOUT,
            accept_redirects: false,
        };
        let mut response = self.ctx.request(Method::GET, url, &[], &opts)?;

        let part = part_path(dest);
        let mut file = File::create(&part)
            .map_err(|e| LoaderError::Target(format!("create {}: {e}", part.display())))?;

        let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        loop {
            if Instant::now() >= deadline {
                return Err(LoaderError::Target(format!(
                    "download deadline exceeded: {url}"
                )));
            }
            let n = response
                .read(&mut buf)
                .map_err(|e| LoaderError::Target(format!("read: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| LoaderError::Target(format!("write: {e}")))?;
        }

        file.flush()
            .map_err(|e| LoaderError::Target(format!("flush: {e}")))?;
        file.sync_all()
            .map_err(|e| LoaderError::Target(format!("fsync: {e}")))?;
        drop(file);

        fs::rename(&part, dest)
            .map_err(|e| LoaderError::Target(format!("rename {}: {e}", part.display())))?;
        debug!(url, path = %dest.display(), "media downloaded");
        Ok(())
    }
}

/// Transient partial-download path: `{dest}.part`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
