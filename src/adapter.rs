//! Conversions from raw m.weibo.cn JSON payloads into typed records.
//!
//! The mobile API is loosely shaped: ids arrive as strings or numbers,
//! optional blocks come and go, and timestamps use half a dozen formats.
//! Everything here is defensive; only genuinely critical fields (a post's
//! `mid` and `created_at`) escalate to [`LoaderError::ApiSchema`].

use crate::error::{LoaderError, Result};
use crate::{cst, MediaItem, MediaType, Post, SuperTopic, User};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use url::Url;

static MINUTES_AGO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*(?:分钟前|分鐘前)$").expect("valid regex"));
static YESTERDAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^昨天\s*(\d{2}):(\d{2})$").expect("valid regex"));
static MONTH_DAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{2})-(\d{2})$").expect("valid regex"));

/// Video stream keys in descending quality order.
const VIDEO_URL_KEYS: [&str; 4] = ["stream_url_hd", "mp4_720p_mp4", "mp4_hd_url", "stream_url"];

/// Parse the timestamp formats emitted by the mobile API, anchored to `now`
/// for the relative forms. The result is always CST.
pub fn parse_weibo_datetime(
    raw: &str,
    now: DateTime<FixedOffset>,
) -> Result<DateTime<FixedOffset>> {
    let raw = raw.trim();
    let now = now.with_timezone(&cst());

    // Absolute form: "Mon Oct 07 12:34:56 +0800 2025"
    if let Ok(dt) = DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y") {
        return Ok(dt.with_timezone(&cst()));
    }

    if let Some(caps) = MINUTES_AGO_RE.captures(raw) {
        let minutes: i64 = caps[1]
            .parse()
            .map_err(|_| LoaderError::ApiSchema(format!("invalid date: {raw}")))?;
        let dt = now - Duration::minutes(minutes);
        return dt
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .ok_or_else(|| LoaderError::ApiSchema(format!("invalid date: {raw}")));
    }

    if let Some(caps) = YESTERDAY_RE.captures(raw) {
        let hour: u32 = caps[1].parse().unwrap_or(0);
        let minute: u32 = caps[2].parse().unwrap_or(0);
        return (now - Duration::days(1))
            .with_hour(hour)
            .and_then(|d| d.with_minute(minute))
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_nanosecond(0))
            .ok_or_else(|| LoaderError::ApiSchema(format!("invalid date: {raw}")));
    }

    if let Some(caps) = MONTH_DAY_RE.captures(raw) {
        let month: u32 = caps[1].parse().unwrap_or(0);
        let day: u32 = caps[2].parse().unwrap_or(0);
        let date = NaiveDate::from_ymd_opt(now.year(), month, day)
            .ok_or_else(|| LoaderError::ApiSchema(format!("invalid date: {raw}")))?;
        let dt = date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| naive.and_local_timezone(cst()).single())
            .ok_or_else(|| LoaderError::ApiSchema(format!("invalid date: {raw}")))?;
        return Ok(dt);
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let dt = date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| naive.and_local_timezone(cst()).single())
            .ok_or_else(|| LoaderError::ApiSchema(format!("invalid date: {raw}")))?;
        return Ok(dt);
    }

    Err(LoaderError::ApiSchema(format!("unknown date format: {raw}")))
}

/// [`parse_weibo_datetime`] anchored to the current time.
pub fn parse_weibo_datetime_now(raw: &str) -> Result<DateTime<FixedOffset>> {
    parse_weibo_datetime(raw, Utc::now().with_timezone(&cst()))
}

/// Read a field that may be encoded as a JSON string or number.
fn string_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Parse a user block.
pub fn parse_user(raw: &Value) -> Result<User> {
    let uid = string_field(raw.get("id"))
        .or_else(|| string_field(raw.get("idstr")))
        .ok_or_else(|| LoaderError::ApiSchema("user missing id".to_string()))?;

    let nickname = str_field(raw.get("screen_name"))
        .or_else(|| str_field(raw.get("nickname")))
        .unwrap_or_else(|| format!("user_{uid}"));

    let avatar = str_field(raw.get("avatar_large"))
        .or_else(|| str_field(raw.get("profile_image_url")));

    Ok(User {
        uid,
        nickname,
        avatar,
    })
}

/// Parse a super-topic card.
pub fn parse_supertopic(raw: &Value) -> Result<SuperTopic> {
    let containerid = string_field(raw.get("containerid"))
        .or_else(|| string_field(raw.get("id")))
        .ok_or_else(|| LoaderError::ApiSchema("supertopic missing containerid".to_string()))?;

    let name = str_field(raw.get("topic_title"))
        .or_else(|| str_field(raw.get("topic_name")))
        .unwrap_or_else(|| "topic".to_string());

    Ok(SuperTopic { containerid, name })
}

/// Stem of the last path segment of a URL, used as a filename hint.
fn url_stem(raw_url: &str) -> Option<String> {
    let parsed = Url::parse(raw_url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let stem = Path::new(segment).file_stem()?.to_string_lossy().into_owned();
    if stem.is_empty() {
        None
    } else {
        Some(stem)
    }
}

fn extract_media(mblog: &Value) -> Vec<MediaItem> {
    let mut items = Vec::new();

    if let Some(pics) = mblog.get("pics").and_then(Value::as_array) {
        for (i, pic) in pics.iter().enumerate() {
            let url = str_field(pic.get("large").and_then(|l| l.get("url")))
                .or_else(|| str_field(pic.get("url")));
            if let Some(url) = url {
                items.push(MediaItem {
                    media_type: MediaType::Picture,
                    filename_hint: url_stem(&url),
                    url,
                    index: i,
                });
            }
        }
    }

    let page = mblog.get("page_info");
    if page.and_then(|p| p.get("type")).and_then(Value::as_str) == Some("video") {
        let info = page.and_then(|p| p.get("media_info"));
        let url = VIDEO_URL_KEYS
            .iter()
            .find_map(|key| str_field(info.and_then(|i| i.get(*key))));
        if let Some(url) = url {
            items.push(MediaItem {
                media_type: MediaType::Video,
                filename_hint: url_stem(&url),
                index: items.len(),
                url,
            });
        }
    }

    items
}

/// Parse a post card. `raw_card` may be the card wrapper (with an `mblog`
/// block) or a bare status object.
pub fn parse_post(raw_card: &Value) -> Result<Post> {
    let mblog = raw_card.get("mblog").unwrap_or(raw_card);

    let mid = string_field(mblog.get("mid"))
        .or_else(|| string_field(mblog.get("id")))
        .ok_or_else(|| LoaderError::ApiSchema("post missing mid".to_string()))?;

    let created_raw = str_field(mblog.get("created_at"))
        .ok_or_else(|| LoaderError::ApiSchema(format!("post {mid} missing created_at")))?;

    let user = match mblog.get("user") {
        Some(u) if u.is_object() => parse_user(u).ok(),
        _ => None,
    };

    let post = Post {
        bid: str_field(mblog.get("bid")),
        text: str_field(mblog.get("text_raw"))
            .or_else(|| str_field(mblog.get("text")))
            .unwrap_or_default(),
        created_at: parse_weibo_datetime_now(&created_raw)?,
        user,
        media_items: extract_media(mblog),
        raw: raw_card.clone(),
        mid,
    };
    post.validate().map_err(LoaderError::ApiSchema)?;
    Ok(post)
}

/// Parse every post card of a feed page, in order, dropping duplicates.
pub fn parse_feed_posts(data: &Value) -> Vec<Post> {
    let mut posts = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let Some(cards) = data.get("cards").and_then(Value::as_array) else {
        return posts;
    };

    for card in cards {
        if !card.is_object() {
            continue;
        }
        let group = card
            .get("card_group")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in std::iter::once(card).chain(group.iter()) {
            if !item.is_object() || item.get("mblog").is_none() {
                continue;
            }
            match parse_post(item) {
                Ok(post) => {
                    if seen.insert(post.mid.clone()) {
                        posts.push(post);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparsable card");
                }
            }
        }
    }

    posts
}

/// Extract the next-page cursor (`since_id`) from a feed page.
pub fn extract_next_cursor(data: &Value) -> Option<String> {
    string_field(
        data.get("cardlistInfo")
            .and_then(|info| info.get("since_id")),
    )
}
