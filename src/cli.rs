//! Command-line surface and target string parsing.

use crate::context::captcha::CaptchaMode;
use crate::error::{LoaderError, Result};
use crate::Target;
use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

static DETAIL_MID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/detail/([^/?#]+)").expect("valid regex"));

/// Maximum worker pool size; more would only trip server-side throttling.
const MAX_WORKERS_LIMIT: usize = 16;

/// Parse and validate the worker pool size.
fn parse_workers(s: &str) -> std::result::Result<usize, String> {
    let value: usize = s.parse().map_err(|_| format!("'{s}' is not a valid number"))?;
    if value == 0 {
        return Err("max-workers must be at least 1".to_string());
    }
    if value > MAX_WORKERS_LIMIT {
        return Err(format!(
            "max-workers {value} exceeds maximum of {MAX_WORKERS_LIMIT}"
        ));
    }
    Ok(value)
}

/// Parse and validate the request interval.
fn parse_interval(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{s}' is not a valid number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err("request-interval must be >= 0".to_string());
    }
    Ok(value)
}

fn parse_captcha_mode(s: &str) -> std::result::Result<CaptchaMode, String> {
    CaptchaMode::from_str(s)
}

/// Download pictures and videos from the Weibo mobile site.
#[derive(Parser, Debug)]
#[command(name = "weiboloader", version, about)]
pub struct Cli {
    /// Targets: UID or nickname, #supertopic, :search keyword, or a post URL
    pub targets: Vec<String>,

    /// Download a single post by its MID
    #[arg(short = 'm', long)]
    pub mid: Option<String>,

    /// Import cookies from a local browser
    #[arg(long, value_parser = ["chrome", "firefox", "edge"])]
    pub load_cookies: Option<String>,

    /// Cookie string ("SUB=...; SUBP=...")
    #[arg(long)]
    pub cookie: Option<String>,

    /// File containing a cookie string
    #[arg(long)]
    pub cookie_file: Option<PathBuf>,

    /// Session file path (defaults to the newest session_{uid}.dat)
    #[arg(long = "sessionfile")]
    pub session_file: Option<PathBuf>,

    /// Mint anonymous visitor cookies before downloading
    #[arg(long)]
    pub visitor_cookies: bool,

    /// Skip video media
    #[arg(long)]
    pub no_videos: bool,

    /// Skip picture media
    #[arg(long)]
    pub no_pictures: bool,

    /// Write {mid}.json sidecars with the raw post payload
    #[arg(long)]
    pub metadata_json: bool,

    /// Template for {mid}.txt sidecars (same variables as --filename-pattern)
    #[arg(long)]
    pub post_metadata_txt: Option<String>,

    /// Directory pattern override (default depends on target kind)
    #[arg(long)]
    pub dirname_pattern: Option<String>,

    /// Filename pattern
    #[arg(long, default_value = crate::constants::DEFAULT_FILENAME_PATTERN)]
    pub filename_pattern: String,

    /// Stop after N posts per target (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub count: usize,

    /// Stop a target once an already-downloaded file is encountered
    #[arg(long)]
    pub fast_update: bool,

    /// Stamps file enabling incremental updates across runs
    #[arg(long)]
    pub latest_stamps: Option<PathBuf>,

    /// Ignore checkpoints and start every target from the beginning
    #[arg(long)]
    pub no_resume: bool,

    /// Minimum seconds between api requests
    #[arg(long, default_value_t = 0.0, value_parser = parse_interval)]
    pub request_interval: f64,

    /// CAPTCHA handling: auto, browser, manual or skip
    #[arg(long, default_value = "auto", value_parser = parse_captcha_mode)]
    pub captcha_mode: CaptchaMode,

    /// Concurrent media downloads per post (max: 16)
    #[arg(long, default_value_t = crate::constants::DEFAULT_MAX_WORKERS, value_parser = parse_workers)]
    pub max_workers: usize,

    /// Root directory media is written under
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Checkpoint directory (default: <output-dir>/.checkpoints)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
}

fn extract_mid_from_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    if let Some(caps) = DETAIL_MID_RE.captures(parsed.path()) {
        let mid = caps[1].trim();
        if !mid.is_empty() {
            return Some(mid.to_string());
        }
    }
    for key in ["mid", "id"] {
        if let Some((_, value)) = parsed.query_pairs().find(|(k, _)| k == key) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn looks_like_containerid(identifier: &str) -> bool {
    identifier.starts_with("100808") || identifier.ends_with("_-_feed")
}

/// Parse one positional target token. `mid_flag` is the value of `--mid`
/// and wins for plain tokens.
pub fn parse_target(raw: &str, mid_flag: Option<&str>) -> Result<Target> {
    let token = raw.trim();

    if token.starts_with("http://") || token.starts_with("https://") {
        let mid = extract_mid_from_url(token)
            .ok_or_else(|| LoaderError::Init(format!("cannot parse mid from url: {raw}")))?;
        return Ok(Target::Mid { mid });
    }

    if let Some(mid) = mid_flag.map(str::trim).filter(|m| !m.is_empty()) {
        return Ok(Target::Mid {
            mid: mid.to_string(),
        });
    }

    if let Some(identifier) = token.strip_prefix('#') {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(LoaderError::Init("empty supertopic target".to_string()));
        }
        return Ok(Target::SuperTopic {
            identifier: identifier.to_string(),
            is_containerid: looks_like_containerid(identifier),
        });
    }

    if let Some(keyword) = token.strip_prefix(':') {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(LoaderError::Init("empty search target".to_string()));
        }
        return Ok(Target::Search {
            keyword: keyword.to_string(),
        });
    }

    if token.is_empty() {
        return Err(LoaderError::Init("missing target".to_string()));
    }

    Ok(Target::User {
        identifier: token.to_string(),
        is_uid: token.chars().all(|c| c.is_ascii_digit()),
    })
}

/// Parse every target of a CLI invocation.
pub fn parse_targets(cli: &Cli) -> Result<Vec<Target>> {
    if cli.targets.is_empty() && cli.mid.is_none() {
        return Err(LoaderError::Init(
            "at least one target or --mid is required".to_string(),
        ));
    }

    if cli.targets.is_empty() {
        return Ok(vec![parse_target("", cli.mid.as_deref())?]);
    }

    cli.targets
        .iter()
        .map(|raw| parse_target(raw, cli.mid.as_deref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_token_is_uid() {
        assert_eq!(
            parse_target("1234567890", None).unwrap(),
            Target::User {
                identifier: "1234567890".to_string(),
                is_uid: true
            }
        );
    }

    #[test]
    fn test_name_token_is_nickname() {
        assert_eq!(
            parse_target("some_nickname", None).unwrap(),
            Target::User {
                identifier: "some_nickname".to_string(),
                is_uid: false
            }
        );
    }

    #[test]
    fn test_hash_token_is_supertopic() {
        assert_eq!(
            parse_target("#rustlang", None).unwrap(),
            Target::SuperTopic {
                identifier: "rustlang".to_string(),
                is_containerid: false
            }
        );
        assert_eq!(
            parse_target("#100808abc", None).unwrap(),
            Target::SuperTopic {
                identifier: "100808abc".to_string(),
                is_containerid: true
            }
        );
        assert_eq!(
            parse_target("#custom_-_feed", None).unwrap(),
            Target::SuperTopic {
                identifier: "custom_-_feed".to_string(),
                is_containerid: true
            }
        );
        assert!(parse_target("#", None).is_err());
    }

    #[test]
    fn test_colon_token_is_search() {
        assert_eq!(
            parse_target(":rust lang", None).unwrap(),
            Target::Search {
                keyword: "rust lang".to_string()
            }
        );
        assert!(parse_target(":", None).is_err());
    }

    #[test]
    fn test_url_token_is_mid() {
        assert_eq!(
            parse_target("https://m.weibo.cn/detail/4990", None).unwrap(),
            Target::Mid {
                mid: "4990".to_string()
            }
        );
        assert_eq!(
            parse_target("https://m.weibo.cn/status?mid=5001", None).unwrap(),
            Target::Mid {
                mid: "5001".to_string()
            }
        );
        assert!(parse_target("https://m.weibo.cn/", None).is_err());
    }

    #[test]
    fn test_mid_flag_wins_for_plain_tokens() {
        assert_eq!(
            parse_target("", Some("4990")).unwrap(),
            Target::Mid {
                mid: "4990".to_string()
            }
        );
        // URLs still parse as themselves.
        assert_eq!(
            parse_target("https://m.weibo.cn/detail/1111", Some("4990")).unwrap(),
            Target::Mid {
                mid: "1111".to_string()
            }
        );
    }

    #[test]
    fn test_empty_token_without_mid_fails() {
        assert!(matches!(
            parse_target("  ", None),
            Err(LoaderError::Init(_))
        ));
    }

    #[test]
    fn test_cli_parses_full_surface() {
        let cli = Cli::parse_from([
            "weiboloader",
            "1234567890",
            "#topic",
            "--no-videos",
            "--metadata-json",
            "--count",
            "10",
            "--fast-update",
            "--latest-stamps",
            "stamps.json",
            "--request-interval",
            "1.5",
            "--captcha-mode",
            "manual",
            "--max-workers",
            "8",
        ]);
        assert_eq!(cli.targets.len(), 2);
        assert!(cli.no_videos);
        assert!(cli.metadata_json);
        assert_eq!(cli.count, 10);
        assert!(cli.fast_update);
        assert_eq!(cli.request_interval, 1.5);
        assert_eq!(cli.captcha_mode, CaptchaMode::Manual);
        assert_eq!(cli.max_workers, 8);
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        assert!(Cli::try_parse_from(["weiboloader", "x", "--max-workers", "0"]).is_err());
        assert!(Cli::try_parse_from(["weiboloader", "x", "--max-workers", "99"]).is_err());
        assert!(Cli::try_parse_from(["weiboloader", "x", "--request-interval", "-1"]).is_err());
        assert!(Cli::try_parse_from(["weiboloader", "x", "--captcha-mode", "never"]).is_err());
    }
}
