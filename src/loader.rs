//! Per-target download orchestration.
//!
//! For each target: resolve identity, take the target lock, thaw the
//! iterator from its checkpoint, then pull posts and fan their media out to
//! the worker pool. The checkpoint advances after every fully resolved
//! post; a post cut short by its deadline is reprocessed on the next run.
//! One target's failure never aborts the batch.

use crate::constants::{PER_MEDIA_TIMEOUT, POLL_TICK, POST_TIMEOUT_FLOOR};
use crate::context::WeiboContext;
use crate::downloader::pool::{MediaJob, WorkerPool};
use crate::downloader::MediaDownloader;
use crate::error::{LoaderError, Result};
use crate::events::{safe_emit, Event, EventKind, MediaOutcome, ProgressSink};
use crate::feed::{FeedPage, PageFetcher, PostIterator};
use crate::naming::{self, TemplateVars};
use crate::resume::CheckpointStore;
use crate::shutdown::{self, SharedShutdown};
use crate::stamps::LatestStamps;
use crate::{MediaItem, MediaType, Post, Target};
use chrono::{DateTime, FixedOffset};
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Immutable run configuration threaded through the orchestrator.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Directory pattern override; target-kind defaults apply when `None`.
    pub dirname_pattern: Option<String>,
    /// Filename template.
    pub filename_pattern: String,
    /// Skip video media.
    pub no_videos: bool,
    /// Skip picture media.
    pub no_pictures: bool,
    /// Stop after this many posts per target; 0 means unlimited.
    pub count: usize,
    /// Stop a target once a pre-existing file is skipped.
    pub fast_update: bool,
    /// Path of the stamps file enabling incremental cutoffs.
    pub latest_stamps: Option<PathBuf>,
    /// Write `{mid}.json` raw-payload sidecars.
    pub metadata_json: bool,
    /// Template for `{mid}.txt` sidecars.
    pub post_metadata_txt: Option<String>,
    /// Media worker pool size.
    pub max_workers: usize,
    /// Ignore checkpoints entirely.
    pub no_resume: bool,
    /// Checkpoint directory override.
    pub checkpoint_dir: Option<PathBuf>,
    /// Root under which target directories are created.
    pub output_dir: PathBuf,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            dirname_pattern: None,
            filename_pattern: crate::constants::DEFAULT_FILENAME_PATTERN.to_string(),
            no_videos: false,
            no_pictures: false,
            count: 0,
            fast_update: false,
            latest_stamps: None,
            metadata_json: false,
            post_metadata_txt: None,
            max_workers: crate::constants::DEFAULT_MAX_WORKERS,
            no_resume: false,
            checkpoint_dir: None,
            output_dir: PathBuf::from("."),
        }
    }
}

impl LoaderOptions {
    /// Deterministic digest over the options that change which posts a
    /// target yields; a mismatch invalidates saved checkpoints.
    pub fn options_hash(&self) -> String {
        let payload = serde_json::json!({
            "no_videos": self.no_videos,
            "no_pictures": self.no_pictures,
            "count": self.count,
            "fast_update": self.fast_update,
        });
        let digest = Sha256::digest(payload.to_string().as_bytes());
        digest.iter().take(8).fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }
}

/// Aggregate counts of one target run.
#[derive(Debug, Clone, Default)]
pub struct TargetStats {
    /// Posts fully resolved.
    pub posts_processed: usize,
    /// Media files downloaded.
    pub downloaded: usize,
    /// Media files skipped (already present).
    pub skipped: usize,
    /// Media files failed or cancelled.
    pub failed: usize,
    /// No failures occurred.
    pub ok: bool,
    /// The run was cut short by an interrupt.
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
enum FeedKind {
    User { uid: String },
    SuperTopic { containerid: String },
    Search { keyword: String },
    Single { mid: String },
}

struct ContainerFeed {
    ctx: Arc<WeiboContext>,
    kind: FeedKind,
    single_done: Cell<bool>,
}

impl PageFetcher for ContainerFeed {
    fn fetch_page(&self, page: u32, cursor: Option<&str>) -> Result<FeedPage> {
        let (posts, next_cursor) = match &self.kind {
            FeedKind::User { uid } => self.ctx.get_user_posts(uid, page, cursor)?,
            FeedKind::SuperTopic { containerid } => {
                self.ctx.get_supertopic_posts(containerid, page, cursor)?
            }
            FeedKind::Search { keyword } => self.ctx.search_posts(keyword, page, cursor)?,
            FeedKind::Single { mid } => {
                if self.single_done.get() {
                    return Ok(FeedPage {
                        posts: Vec::new(),
                        next_cursor: None,
                        has_more: false,
                    });
                }
                self.single_done.set(true);
                (vec![self.ctx.get_post_by_mid(mid)?], None)
            }
        };
        let has_more = !posts.is_empty() && next_cursor.is_some();
        Ok(FeedPage {
            posts,
            next_cursor,
            has_more,
        })
    }
}

struct ResolvedTarget {
    target: Target,
    key: String,
    vars: TemplateVars,
    feed: FeedKind,
}

/// The orchestrator: binds context, checkpoints, stamps, the worker pool
/// and the event bus into the per-target workflow.
pub struct WeiboLoader {
    ctx: Arc<WeiboContext>,
    options: LoaderOptions,
    sink: Arc<dyn ProgressSink>,
    options_hash: String,
    checkpoints: CheckpointStore,
    stamps: LatestStamps,
    shutdown: Option<SharedShutdown>,
}

impl WeiboLoader {
    /// Build a loader; creates the output and checkpoint directories.
    pub fn new(
        ctx: Arc<WeiboContext>,
        options: LoaderOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        fs::create_dir_all(&options.output_dir).map_err(|e| {
            LoaderError::Init(format!(
                "cannot create output dir {}: {e}",
                options.output_dir.display()
            ))
        })?;

        let options_hash = options.options_hash();
        let checkpoint_dir = options
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| options.output_dir.join(".checkpoints"));
        let checkpoints = CheckpointStore::new(checkpoint_dir, &options_hash)?;
        let stamps = LatestStamps::load(options.latest_stamps.clone());

        Ok(Self {
            ctx,
            options,
            sink,
            options_hash,
            checkpoints,
            stamps,
            shutdown: shutdown::get_global_shutdown(),
        })
    }

    fn emit(&self, event: Event) {
        safe_emit(self.sink.as_ref(), &event);
    }

    fn interrupted(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    /// Process a batch sequentially. A target failure is recorded and the
    /// batch continues; only an interrupt aborts the loop.
    pub fn download_targets(&mut self, targets: &[Target]) -> Result<BTreeMap<String, bool>> {
        let mut results = BTreeMap::new();
        for target in targets {
            let key = target.target_key();
            match self.download_target(target) {
                Ok(ok) => {
                    results.insert(key, ok);
                }
                Err(LoaderError::Interrupted) => {
                    if let Err(e) = self.stamps.save() {
                        warn!(error = %e, "stamps not saved on interrupt");
                    }
                    return Err(LoaderError::Interrupted);
                }
                Err(e) => {
                    error!(target = %key, error = %e, "target failed");
                    results.insert(key, false);
                }
            }
        }
        self.stamps.save()?;
        Ok(results)
    }

    /// Run one target end to end. Returns whether it completed without
    /// failures; only interrupts surface as errors.
    pub fn download_target(&mut self, target: &Target) -> Result<bool> {
        let resolved = match self.resolve_target(target) {
            Ok(resolved) => resolved,
            Err(LoaderError::Interrupted) => return Err(LoaderError::Interrupted),
            Err(e) => {
                error!(target = %target, error = %e, "cannot resolve target");
                return Ok(false);
            }
        };

        self.emit(Event {
            target_key: Some(resolved.key.clone()),
            ..Event::new(EventKind::TargetStart)
        });

        let _lock = match self.checkpoints.lock(&resolved.key) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(target = %resolved.key, error = %e, "target lock contended");
                self.emit_target_done(&resolved.key, &TargetStats::default());
                return Ok(false);
            }
        };

        let feed = ContainerFeed {
            ctx: Arc::clone(&self.ctx),
            kind: resolved.feed.clone(),
            single_done: Cell::new(false),
        };
        let mut iterator = PostIterator::new(feed, self.options_hash.clone());
        if !self.options.no_resume {
            if let Some(state) = self.checkpoints.load(&resolved.key) {
                if iterator.thaw(state) {
                    info!(target = %resolved.key, seen = iterator.seen_count(), "resumed from checkpoint");
                }
            }
        }

        let stats = match self.run_target(&resolved, &mut iterator) {
            Ok(stats) => stats,
            Err(e) => {
                error!(target = %resolved.key, error = %e, "target run failed");
                self.flush_target(&resolved.key, &iterator);
                self.emit_target_done(&resolved.key, &TargetStats::default());
                return Ok(false);
            }
        };

        if stats.interrupted {
            self.emit(Event {
                target_key: Some(resolved.key.clone()),
                ..Event::new(EventKind::Interrupted)
            });
            self.emit_target_done(&resolved.key, &stats);
            return Err(LoaderError::Interrupted);
        }

        self.emit_target_done(&resolved.key, &stats);
        Ok(stats.ok)
    }

    fn emit_target_done(&self, target_key: &str, stats: &TargetStats) {
        self.emit(Event {
            target_key: Some(target_key.to_string()),
            posts_processed: Some(stats.posts_processed),
            downloaded: Some(stats.downloaded),
            skipped: Some(stats.skipped),
            failed: Some(stats.failed),
            ok: Some(stats.ok && !stats.interrupted),
            ..Event::new(EventKind::TargetDone)
        });
    }

    /// Best-effort persistence when a target bails out early.
    fn flush_target(&mut self, target_key: &str, iterator: &PostIterator<ContainerFeed>) {
        if !self.options.no_resume {
            if let Err(e) = self.checkpoints.save(target_key, &iterator.freeze()) {
                warn!(target = %target_key, error = %e, "checkpoint not saved");
            }
        }
        if let Err(e) = self.stamps.save() {
            warn!(target = %target_key, error = %e, "stamps not saved");
        }
    }

    fn run_target(
        &mut self,
        resolved: &ResolvedTarget,
        iterator: &mut PostIterator<ContainerFeed>,
    ) -> Result<TargetStats> {
        let target_dir = self.build_target_dir(resolved)?;
        let cutoff = self.stamps.get(&resolved.key);
        let downloader = Arc::new(MediaDownloader::new(Arc::clone(&self.ctx)));
        let mut pool = WorkerPool::new(self.options.max_workers, downloader, self.shutdown.clone())?;

        let mut stats = TargetStats {
            ok: true,
            ..TargetStats::default()
        };
        let mut newest: Option<DateTime<FixedOffset>> = None;

        'posts: loop {
            if self.options.count > 0 && stats.posts_processed >= self.options.count {
                debug!(target = %resolved.key, count = self.options.count, "post count reached");
                break;
            }
            if self.interrupted() {
                return self.interrupt_flush(resolved, iterator, &mut pool, stats, newest, cutoff);
            }

            let post = match iterator.next() {
                None => break,
                Some(Ok(post)) => post,
                Some(Err(e)) => return Err(e),
            };

            let created = post.created_at;
            if let Some(cutoff) = cutoff {
                if created <= cutoff {
                    debug!(target = %resolved.key, mid = %post.mid, "incremental cutoff reached");
                    break;
                }
            }

            if self.options.metadata_json {
                self.write_json_sidecar(&target_dir, &post);
            }
            if let Some(template) = self.options.post_metadata_txt.clone() {
                self.write_txt_sidecar(&target_dir, &post, &template, resolved);
            }

            let jobs = self.media_jobs(&target_dir, &post, resolved);
            let media_total = jobs.len();
            let post_index = stats.posts_processed + 1;
            let mut timed_out = false;
            let mut post_skipped = false;

            if media_total > 0 {
                let cancel = Arc::new(AtomicBool::new(false));
                let (reply_tx, reply_rx) = mpsc::channel();
                let destinations: Vec<PathBuf> = jobs.iter().map(|(_, p)| p.clone()).collect();

                for (index, (media, dest)) in jobs.into_iter().enumerate() {
                    let accepted = pool.submit(MediaJob {
                        url: media.url,
                        dest,
                        index,
                        cancel: Arc::clone(&cancel),
                        reply: reply_tx.clone(),
                    });
                    if !accepted {
                        warn!(target = %resolved.key, "worker pool rejected job");
                    }
                }
                drop(reply_tx);

                let post_deadline =
                    Instant::now() + POST_TIMEOUT_FLOOR.max(PER_MEDIA_TIMEOUT * media_total as u32);
                let mut media_done = 0usize;
                let mut reported = vec![false; media_total];

                while media_done < media_total {
                    if self.interrupted() {
                        return self
                            .interrupt_flush(resolved, iterator, &mut pool, stats, newest, cutoff);
                    }
                    if Instant::now() >= post_deadline {
                        timed_out = true;
                        cancel.store(true, Ordering::SeqCst);
                        warn!(target = %resolved.key, mid = %post.mid, "post deadline exceeded, cancelling pending media");
                        for index in 0..media_total {
                            if reported[index] {
                                continue;
                            }
                            reported[index] = true;
                            media_done += 1;
                            stats.failed += 1;
                            stats.ok = false;
                            self.emit_media_done(
                                MediaOutcome::Failed,
                                media_done,
                                media_total,
                                post_index,
                                &destinations[index],
                            );
                        }
                        break;
                    }

                    match reply_rx.recv_timeout(POLL_TICK) {
                        Ok((index, result)) => {
                            if reported.get(index).copied().unwrap_or(true) {
                                continue;
                            }
                            reported[index] = true;
                            media_done += 1;
                            match result.outcome {
                                MediaOutcome::Downloaded => stats.downloaded += 1,
                                MediaOutcome::Skipped => {
                                    stats.skipped += 1;
                                    post_skipped = true;
                                }
                                MediaOutcome::Failed => {
                                    stats.failed += 1;
                                    stats.ok = false;
                                }
                            }
                            self.emit_media_done(
                                result.outcome,
                                media_done,
                                media_total,
                                post_index,
                                &result.path,
                            );
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            // Workers are gone; account for whatever is left.
                            for index in 0..media_total {
                                if reported[index] {
                                    continue;
                                }
                                reported[index] = true;
                                media_done += 1;
                                stats.failed += 1;
                                stats.ok = false;
                                self.emit_media_done(
                                    MediaOutcome::Failed,
                                    media_done,
                                    media_total,
                                    post_index,
                                    &destinations[index],
                                );
                            }
                            break;
                        }
                    }
                }
            }

            stats.posts_processed += 1;
            if !timed_out {
                if newest.map_or(true, |n| created > n) {
                    newest = Some(created);
                }
                if !self.options.no_resume {
                    self.checkpoints.save(&resolved.key, &iterator.freeze())?;
                }
            }
            self.emit(Event {
                posts_processed: Some(stats.posts_processed),
                target_key: Some(resolved.key.clone()),
                ..Event::new(EventKind::PostDone)
            });

            if self.options.fast_update && post_skipped {
                info!(target = %resolved.key, "fast-update: existing file seen, stopping target");
                break 'posts;
            }
        }

        drop(pool);

        if let Some(newest) = newest {
            if cutoff.map_or(true, |c| newest > c) {
                self.stamps.record(&resolved.key, newest);
            }
        }
        // A clean completion retires the checkpoint so the next run starts
        // from the head of the feed; interrupts and errors keep it.
        if !self.options.no_resume {
            self.checkpoints.clear(&resolved.key)?;
        }
        self.stamps.save()?;

        Ok(stats)
    }

    /// Interrupt: abandon the pool, persist position and stamps, and report
    /// the partial stats upward.
    fn interrupt_flush(
        &mut self,
        resolved: &ResolvedTarget,
        iterator: &PostIterator<ContainerFeed>,
        pool: &mut WorkerPool,
        mut stats: TargetStats,
        newest: Option<DateTime<FixedOffset>>,
        cutoff: Option<DateTime<FixedOffset>>,
    ) -> Result<TargetStats> {
        info!(target = %resolved.key, "interrupt: flushing checkpoint and stamps");
        pool.shutdown_now();
        if let Some(newest) = newest {
            if cutoff.map_or(true, |c| newest > c) {
                self.stamps.record(&resolved.key, newest);
            }
        }
        self.flush_target(&resolved.key, iterator);
        stats.ok = false;
        stats.interrupted = true;
        Ok(stats)
    }

    fn emit_media_done(
        &self,
        outcome: MediaOutcome,
        media_done: usize,
        media_total: usize,
        post_index: usize,
        path: &Path,
    ) {
        self.emit(Event {
            outcome: Some(outcome),
            media_done: Some(media_done),
            media_total: Some(media_total),
            post_index: Some(post_index),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            ..Event::new(EventKind::MediaDone)
        });
    }

    fn resolve_target(&self, target: &Target) -> Result<ResolvedTarget> {
        self.emit(Event {
            message: Some(format!("Resolving {}", target.target_key())),
            ..Event::new(EventKind::Stage)
        });

        match target {
            Target::User { identifier, is_uid } => {
                let uid = if *is_uid {
                    identifier.clone()
                } else {
                    self.ctx.resolve_nickname_to_uid(identifier)?
                };
                let nickname = match self.ctx.get_user_info(&uid) {
                    Ok(user) => user.nickname,
                    Err(e) => {
                        debug!(uid, error = %e, "profile lookup failed, using uid as name");
                        uid.clone()
                    }
                };
                let canonical = Target::User {
                    identifier: uid.clone(),
                    is_uid: true,
                };
                Ok(ResolvedTarget {
                    key: canonical.target_key(),
                    vars: TemplateVars {
                        uid: uid.clone(),
                        nickname,
                        ..TemplateVars::default()
                    },
                    feed: FeedKind::User { uid },
                    target: canonical,
                })
            }
            Target::SuperTopic {
                identifier,
                is_containerid,
            } => {
                let (containerid, name) = if *is_containerid {
                    (identifier.clone(), identifier.clone())
                } else {
                    let topics = self.ctx.search_supertopics(identifier)?;
                    let topic = topics.into_iter().next().ok_or_else(|| {
                        LoaderError::Target(format!("supertopic not found: {identifier}"))
                    })?;
                    (topic.containerid, topic.name)
                };
                let canonical = Target::SuperTopic {
                    identifier: containerid.clone(),
                    is_containerid: true,
                };
                Ok(ResolvedTarget {
                    key: canonical.target_key(),
                    vars: TemplateVars {
                        topic_name: name,
                        ..TemplateVars::default()
                    },
                    feed: FeedKind::SuperTopic { containerid },
                    target: canonical,
                })
            }
            Target::Search { keyword } => Ok(ResolvedTarget {
                target: target.clone(),
                key: target.target_key(),
                vars: TemplateVars {
                    keyword: keyword.clone(),
                    ..TemplateVars::default()
                },
                feed: FeedKind::Search {
                    keyword: keyword.clone(),
                },
            }),
            Target::Mid { mid } => Ok(ResolvedTarget {
                target: target.clone(),
                key: target.target_key(),
                vars: TemplateVars {
                    mid: mid.clone(),
                    ..TemplateVars::default()
                },
                feed: FeedKind::Single { mid: mid.clone() },
            }),
        }
    }

    fn build_target_dir(&self, resolved: &ResolvedTarget) -> Result<PathBuf> {
        let relative = naming::build_directory(
            &resolved.target,
            self.options.dirname_pattern.as_deref(),
            &resolved.vars,
        );
        let dir = self.options.output_dir.join(relative);
        fs::create_dir_all(&dir)
            .map_err(|e| LoaderError::Target(format!("create {}: {e}", dir.display())))?;
        Ok(dir)
    }

    fn media_jobs(
        &self,
        target_dir: &Path,
        post: &Post,
        resolved: &ResolvedTarget,
    ) -> Vec<(MediaItem, PathBuf)> {
        let mut jobs = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        for media in &post.media_items {
            match media.media_type {
                MediaType::Video if self.options.no_videos => continue,
                MediaType::Picture if self.options.no_pictures => continue,
                _ => {}
            }
            let path = self.media_path(target_dir, post, media, resolved, &seen);
            seen.insert(path.clone());
            jobs.push((media.clone(), path));
        }
        jobs
    }

    fn media_path(
        &self,
        target_dir: &Path,
        post: &Post,
        media: &MediaItem,
        resolved: &ResolvedTarget,
        seen: &HashSet<PathBuf>,
    ) -> PathBuf {
        let name = media
            .filename_hint
            .clone()
            .unwrap_or_else(|| format!("{}_{}", media.media_type, media.index));
        let vars = self.post_vars(post, resolved, Some(media), name);
        let mut filename = naming::build_filename(&self.options.filename_pattern, &vars);

        let extension = extension_for(&media.url, media.media_type);
        if !filename.to_lowercase().ends_with(&extension.to_lowercase()) {
            filename.push_str(&extension);
        }

        let path = target_dir.join(&filename);
        if !seen.contains(&path) {
            return path;
        }
        // Same rendered name within one post: append a counter.
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let suffix = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1;
        loop {
            let candidate = target_dir.join(format!("{stem}_{counter}{suffix}"));
            if !seen.contains(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    fn post_vars(
        &self,
        post: &Post,
        resolved: &ResolvedTarget,
        media: Option<&MediaItem>,
        name: String,
    ) -> TemplateVars {
        TemplateVars {
            nickname: post
                .user
                .as_ref()
                .map(|u| u.nickname.clone())
                .unwrap_or_else(|| resolved.vars.nickname.clone()),
            uid: post
                .user
                .as_ref()
                .map(|u| u.uid.clone())
                .unwrap_or_else(|| resolved.vars.uid.clone()),
            mid: post.mid.clone(),
            bid: post.bid.clone().unwrap_or_default(),
            text: post.text.clone(),
            media_type: media.map(|m| m.media_type.to_string()).unwrap_or_default(),
            name,
            topic_name: resolved.vars.topic_name.clone(),
            keyword: resolved.vars.keyword.clone(),
            date: Some(post.created_at),
            index: media.map(|m| m.index),
        }
    }

    fn write_json_sidecar(&self, target_dir: &Path, post: &Post) {
        let path = target_dir.join(format!("{}.json", post.mid));
        match serde_json::to_string_pretty(&post.raw) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!(path = %path.display(), error = %e, "json sidecar not written");
                }
            }
            Err(e) => warn!(mid = %post.mid, error = %e, "raw payload not serializable"),
        }
    }

    fn write_txt_sidecar(
        &self,
        target_dir: &Path,
        post: &Post,
        template: &str,
        resolved: &ResolvedTarget,
    ) {
        let vars = self.post_vars(post, resolved, None, String::new());
        let rendered = naming::render_template(template, &vars);
        let path = target_dir.join(format!("{}.txt", post.mid));
        if let Err(e) = fs::write(&path, rendered) {
            warn!(path = %path.display(), error = %e, "txt sidecar not written");
        }
    }
}

/// File extension inferred from a media URL path, with a type-based
/// fallback.
fn extension_for(url: &str, media_type: MediaType) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()?
                .filter(|s| !s.is_empty())
                .next_back()
                .map(str::to_owned)
        })
        .and_then(|segment| {
            Path::new(&segment)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
        })
        .unwrap_or_else(|| match media_type {
            MediaType::Video => ".mp4".to_string(),
            MediaType::Picture => ".jpg".to_string(),
        })
}
