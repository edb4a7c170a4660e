//! Engine-wide constants and default locations.

use std::path::PathBuf;
use std::time::Duration;

/// Base URL of the Weibo mobile site.
pub const BASE_URL: &str = "https://m.weibo.cn";

/// Mobile Chrome user agent sent with every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// Default timeout for api-bucket requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Inter-chunk read timeout on streaming media sockets.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Total wall-clock ceiling for a single media download.
pub const MEDIA_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-media-item share of a post-level deadline.
pub const PER_MEDIA_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum post-level deadline regardless of media count.
pub const POST_TIMEOUT_FLOOR: Duration = Duration::from_secs(60);

/// Tick of the completion polling loop; bounds interrupt latency.
pub const POLL_TICK: Duration = Duration::from_millis(500);

/// How long a CAPTCHA handler may hold up a target.
pub const CAPTCHA_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout of the login verification probe.
pub const LOGIN_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read/write chunk size for streaming downloads.
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Characters stripped from every filename component.
pub const ILLEGAL_FILENAME_CHARS: &str = "\\/:*?\"<>|";

/// Maximum codepoints of `{text}` substituted into a filename.
pub const MAX_TEXT_LEN: usize = 50;

/// Date format used when a `{date}` placeholder carries no explicit format.
pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Schema version of checkpoint records.
pub const CHECKPOINT_VERSION: &str = "1";

/// Schema version of serialized session files.
pub const SESSION_VERSION: &str = "1";

/// Hard cap on pages fetched per target, guarding against cursor loops.
pub const MAX_PAGES: u32 = 10_000;

/// Default media worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default filename template.
pub const DEFAULT_FILENAME_PATTERN: &str = "{date}_{name}";

/// Per-user configuration directory (`~/.config/weiboloader`).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("weiboloader")
}
