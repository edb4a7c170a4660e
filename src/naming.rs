//! Destination naming: sanitization, filename templates, directory layout.
//!
//! Templates use `{variable}` placeholders with optional format suffixes:
//! `{date:%Y-%m}` formats the post timestamp, `{index:3}` zero-pads the
//! media index. Every substituted value is stripped of characters that are
//! illegal in filenames on any supported platform.

use crate::constants::{DEFAULT_DATE_FORMAT, ILLEGAL_FILENAME_CHARS, MAX_TEXT_LEN};
use crate::{cst, Target};
use chrono::{DateTime, FixedOffset, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt::Write as _;

static TEMPLATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)(?::([^{}]*))?\}").expect("valid template regex")
});

/// Values available to filename and directory templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    /// Author display name.
    pub nickname: String,
    /// Author uid.
    pub uid: String,
    /// Post id.
    pub mid: String,
    /// Post short id.
    pub bid: String,
    /// Post text.
    pub text: String,
    /// Media kind ("picture" / "video").
    pub media_type: String,
    /// Media name stem.
    pub name: String,
    /// Super-topic name.
    pub topic_name: String,
    /// Search keyword.
    pub keyword: String,
    /// Post timestamp; the current CST time is used when absent.
    pub date: Option<DateTime<FixedOffset>>,
    /// Media index within the post.
    pub index: Option<usize>,
}

/// Strip characters that are illegal in filenames. Idempotent; `.` and `..`
/// collapse to the empty string because they address directories.
pub fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(*c))
        .collect();
    if cleaned == "." || cleaned == ".." {
        String::new()
    } else {
        cleaned
    }
}

fn format_date(date: DateTime<FixedOffset>, spec: Option<&str>) -> String {
    let fmt = spec.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_DATE_FORMAT);
    let mut out = String::new();
    if write!(out, "{}", date.format(fmt)).is_err() {
        return date.format(DEFAULT_DATE_FORMAT).to_string();
    }
    out
}

fn format_index(index: Option<usize>, spec: Option<&str>) -> String {
    let Some(index) = index else {
        return String::new();
    };
    match spec.and_then(|s| s.parse::<usize>().ok()) {
        Some(width) => format!("{index:0width$}"),
        None => index.to_string(),
    }
}

/// Expand `template` with `vars`. Unknown variables expand to the empty
/// string; `{text}` is truncated to 50 codepoints before substitution.
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    TEMPLATE_RE
        .replace_all(template, |caps: &Captures| {
            let spec = caps.get(2).map(|m| m.as_str());
            match &caps[1] {
                "date" => {
                    let date = vars
                        .date
                        .unwrap_or_else(|| Utc::now().with_timezone(&cst()));
                    format_date(date, spec)
                }
                "index" => format_index(vars.index, spec),
                "text" => vars.text.chars().take(MAX_TEXT_LEN).collect(),
                "nickname" => vars.nickname.clone(),
                "uid" => vars.uid.clone(),
                "mid" => vars.mid.clone(),
                "bid" => vars.bid.clone(),
                "type" => vars.media_type.clone(),
                "name" => vars.name.clone(),
                "topic_name" => vars.topic_name.clone(),
                "keyword" => vars.keyword.clone(),
                _ => String::new(),
            }
        })
        .into_owned()
}

/// Render and sanitize a filename, falling back to the post's `mid` (and
/// finally to a fixed stem) when sanitization leaves nothing.
pub fn build_filename(template: &str, vars: &TemplateVars) -> String {
    let sanitized = sanitize(&render_template(template, vars));
    if !sanitized.is_empty() {
        return sanitized;
    }
    let mid = sanitize(&vars.mid);
    if !mid.is_empty() {
        mid
    } else {
        "file".to_string()
    }
}

/// Default directory pattern for a target kind.
pub fn default_dirname_pattern(target: &Target) -> &'static str {
    match target {
        Target::User { .. } => "./{nickname}/",
        Target::SuperTopic { .. } => "./topic/{topic_name}/",
        Target::Search { .. } => "./search/{keyword}/",
        Target::Mid { .. } => "./",
    }
}

/// Render the destination directory for a target, sanitizing each path
/// segment while preserving a leading `./`.
pub fn build_directory(target: &Target, pattern: Option<&str>, vars: &TemplateVars) -> String {
    let pattern = pattern.unwrap_or_else(|| default_dirname_pattern(target));
    let rendered = render_template(pattern, vars);
    let normalized = rendered.replace('\\', "/");
    let ends_with_sep = normalized.ends_with('/');

    let mut parts: Vec<String> = Vec::new();
    for (i, segment) in normalized.split('/').enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 && segment == "." {
            parts.push(".".to_string());
            continue;
        }
        let sanitized = sanitize(segment);
        parts.push(if sanitized.is_empty() {
            "x".to_string()
        } else {
            sanitized
        });
    }

    let joined = parts.join("/");
    if ends_with_sep {
        format!("{joined}/")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_date() -> DateTime<FixedOffset> {
        cst().with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_sanitize_strips_illegal_chars() {
        assert_eq!(sanitize(r#"a\b/c:d*e?f"g<h>i|j"#), "abcdefghij");
        assert_eq!(sanitize("normal-name_123"), "normal-name_123");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in [r#"we?ird:na|me"#, "plain", "日本語テキスト", "..", "a..b"] {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn test_sanitize_rejects_directory_names() {
        assert_eq!(sanitize("."), "");
        assert_eq!(sanitize(".."), "");
        assert_eq!(sanitize("./"), "");
    }

    #[test]
    fn test_render_date_default_and_custom() {
        let vars = TemplateVars {
            date: Some(sample_date()),
            ..TemplateVars::default()
        };
        assert_eq!(render_template("{date}", &vars), "20240305_143000");
        assert_eq!(render_template("{date:%Y-%m}", &vars), "2024-03");
    }

    #[test]
    fn test_render_index_padding() {
        let vars = TemplateVars {
            index: Some(7),
            ..TemplateVars::default()
        };
        assert_eq!(render_template("{index}", &vars), "7");
        assert_eq!(render_template("{index:3}", &vars), "007");

        let none = TemplateVars::default();
        assert_eq!(render_template("x{index}y", &none), "xy");
    }

    #[test]
    fn test_render_truncates_text() {
        let vars = TemplateVars {
            text: "好".repeat(80),
            ..TemplateVars::default()
        };
        let rendered = render_template("{text}", &vars);
        assert_eq!(rendered.chars().count(), MAX_TEXT_LEN);
    }

    #[test]
    fn test_unknown_variable_renders_empty() {
        let vars = TemplateVars::default();
        assert_eq!(render_template("a{bogus}b", &vars), "ab");
    }

    #[test]
    fn test_build_filename_falls_back_to_mid() {
        let vars = TemplateVars {
            mid: "4990".to_string(),
            text: "???".to_string(),
            ..TemplateVars::default()
        };
        assert_eq!(build_filename("{text}", &vars), "4990");
    }

    #[test]
    fn test_build_filename_last_resort() {
        let vars = TemplateVars {
            mid: "??".to_string(),
            ..TemplateVars::default()
        };
        assert_eq!(build_filename("{text}", &vars), "file");
    }

    #[test]
    fn test_build_directory_defaults() {
        let user = Target::User {
            identifier: "42".to_string(),
            is_uid: true,
        };
        let vars = TemplateVars {
            nickname: "alice".to_string(),
            ..TemplateVars::default()
        };
        assert_eq!(build_directory(&user, None, &vars), "./alice/");

        let topic = Target::SuperTopic {
            identifier: "100808x".to_string(),
            is_containerid: true,
        };
        let vars = TemplateVars {
            topic_name: "rust".to_string(),
            ..TemplateVars::default()
        };
        assert_eq!(build_directory(&topic, None, &vars), "./topic/rust/");
    }

    #[test]
    fn test_build_directory_sanitizes_segments() {
        let search = Target::Search {
            keyword: "a/b:c".to_string(),
        };
        let vars = TemplateVars {
            keyword: "a/b:c".to_string(),
            ..TemplateVars::default()
        };
        let dir = build_directory(&search, None, &vars);
        assert_eq!(dir, "./search/a/bc/");
    }

    #[test]
    fn test_build_directory_custom_pattern() {
        let user = Target::User {
            identifier: "42".to_string(),
            is_uid: true,
        };
        let vars = TemplateVars {
            uid: "42".to_string(),
            nickname: "alice".to_string(),
            ..TemplateVars::default()
        };
        assert_eq!(
            build_directory(&user, Some("media/{uid}_{nickname}"), &vars),
            "media/42_alice"
        );
    }
}
