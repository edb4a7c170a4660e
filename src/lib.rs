//! # weiboloader
//!
//! A batch downloader that harvests pictures and videos from the Weibo
//! mobile site (`m.weibo.cn`) for a list of targets, persisting media into a
//! hierarchical on-disk layout while surviving aggressive throttling,
//! CAPTCHA challenges, stalled streams and user interruption.
//!
//! ## Features
//!
//! - **Adaptive rate control**: independent sliding windows for api and
//!   media traffic with reactive exponential backoff on 403/418
//! - **Resumable iteration**: paginated feeds freeze to atomic per-target
//!   checkpoints and thaw to the exact unprocessed tail
//! - **Bounded concurrency**: a fixed worker pool downloads each post's
//!   media in parallel, every network operation under a wall-clock deadline
//! - **Incremental updates**: `--latest-stamps` and `--fast-update` cut a
//!   run short once previously seen content is reached
//! - **Interrupt safety**: a single Ctrl-C flushes checkpoints and stamps
//!   within a second, from any blocking wait
//!
//! ## Architecture
//!
//! - [`ratecontrol`] - two-bucket sliding-window rate controller
//! - [`resume`] - atomic checkpoint store and per-target locks
//! - [`feed`] - resumable paginated post iterator
//! - [`context`] - HTTP context: cookies, sessions, CAPTCHA routing
//! - [`downloader`] - streaming media downloads and the worker pool
//! - [`loader`] - the per-target orchestrator
//! - [`events`] - progress event bus consumed by UI sinks
//! - [`adapter`] / [`naming`] - payload parsing and path templating

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw JSON to record conversions for m.weibo.cn payloads
pub mod adapter;

/// CLI argument surface and target string parsing
pub mod cli;

/// Engine constants
pub mod constants;

/// HTTP context: client, cookies, sessions, CAPTCHA
pub mod context;

/// Media downloads and the bounded worker pool
pub mod downloader;

/// Error taxonomy and exit codes
pub mod error;

/// Progress event bus
pub mod events;

/// Resumable paginated post iterator
pub mod feed;

/// Per-target download orchestration
pub mod loader;

/// Filename and directory templating
pub mod naming;

/// Sliding-window rate control
pub mod ratecontrol;

/// Checkpoint store and target locks
pub mod resume;

/// Interrupt coordination shared across threads
pub mod shutdown;

/// Incremental latest-post stamps
pub mod stamps;

/// Terminal progress sink
pub mod ui;

pub use error::LoaderError;
pub use loader::{LoaderOptions, WeiboLoader};

/// China Standard Time, the fixed +08:00 offset used for every timestamp
/// in this crate.
pub fn cst() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("+08:00 is a valid offset")
}

/// A Weibo account as seen in post payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Numeric account id, as a string.
    pub uid: String,
    /// Display name.
    pub nickname: String,
    /// Avatar URL, when present.
    pub avatar: Option<String>,
}

/// A super-topic (hashtag-anchored feed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuperTopic {
    /// Opaque server-side feed identifier.
    pub containerid: String,
    /// Human-readable topic name.
    pub name: String,
}

/// Kind of a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A still image; the `large` rendition is downloaded.
    Picture,
    /// A video; the highest-quality stream available is downloaded.
    Video,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaType::Picture => "picture",
            MediaType::Video => "video",
        };
        write!(f, "{s}")
    }
}

/// One downloadable media attachment of a post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    /// Picture or video.
    pub media_type: MediaType,
    /// Direct download URL.
    pub url: String,
    /// Position within the post, 0-based.
    pub index: usize,
    /// Server-provided name stem, when one can be derived from the URL.
    pub filename_hint: Option<String>,
}

impl MediaItem {
    /// Validate media item integrity.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err(format!("media item {} has an empty url", self.index));
        }
        Ok(())
    }
}

/// A single Weibo post with its media attachments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    /// Stable post id.
    pub mid: String,
    /// Short id, when present.
    pub bid: Option<String>,
    /// Post text (plain).
    pub text: String,
    /// Creation time, always CST.
    pub created_at: DateTime<FixedOffset>,
    /// Author, when the payload carries one.
    pub user: Option<User>,
    /// Media attachments in display order.
    pub media_items: Vec<MediaItem>,
    /// The untouched original payload, kept for metadata sidecars.
    pub raw: Value,
}

impl Post {
    /// Validate post integrity: a usable id and well-formed media items.
    pub fn validate(&self) -> Result<(), String> {
        if self.mid.trim().is_empty() {
            return Err("post mid cannot be empty".to_string());
        }
        for media in &self.media_items {
            media.validate()?;
        }
        Ok(())
    }
}

/// A download target supplied on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// An account, addressed by uid or nickname.
    User {
        /// uid or nickname.
        identifier: String,
        /// Whether `identifier` is already a numeric uid.
        is_uid: bool,
    },
    /// A super-topic feed, addressed by containerid or display name.
    SuperTopic {
        /// containerid or topic name.
        identifier: String,
        /// Whether `identifier` is already a containerid.
        is_containerid: bool,
    },
    /// A keyword search feed.
    Search {
        /// The search keyword.
        keyword: String,
    },
    /// A single post.
    Mid {
        /// The post id.
        mid: String,
    },
}

impl Target {
    /// Stable key identifying this target for checkpoint, lock and stamp
    /// files.
    pub fn target_key(&self) -> String {
        match self {
            Target::User { identifier, .. } => format!("user:{identifier}"),
            Target::SuperTopic { identifier, .. } => format!("topic:{identifier}"),
            Target::Search { keyword } => format!("search:{keyword}"),
            Target::Mid { mid } => format!("mid:{mid}"),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.target_key())
    }
}
