//! Iterable cookie store and session file persistence.
//!
//! `reqwest`'s bundled jar cannot be enumerated, which makes session files
//! impossible; this store implements [`reqwest::cookie::CookieStore`] over a
//! plain map so cookies can be installed from strings, snapshotted for
//! `session_{uid}.dat`, and inspected (the `SUB` credential check).

use crate::constants::SESSION_VERSION;
use crate::error::{LoaderError, Result};
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Default cookie domain for values installed from user-supplied strings.
const DEFAULT_DOMAIN: &str = ".weibo.cn";

/// One cookie, with the identity-critical attributes preserved across
/// session save/load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Domain the cookie applies to (leading dot tolerated).
    pub domain: String,
    /// Path the cookie applies to.
    pub path: String,
}

/// Thread-safe cookie jar keyed by `(domain, path, name)`.
#[derive(Debug, Default)]
pub struct CookieJar {
    inner: RwLock<HashMap<(String, String, String), CookieRecord>>,
}

impl CookieJar {
    /// An empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cookie.
    pub fn set(&self, name: &str, value: &str, domain: &str, path: &str) {
        let record = CookieRecord {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: path.to_string(),
        };
        let key = (
            record.domain.clone(),
            record.path.clone(),
            record.name.clone(),
        );
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, record);
    }

    /// Value of the first cookie with `name`, regardless of domain.
    pub fn get(&self, name: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    /// All cookies, sorted for deterministic session files.
    pub fn snapshot(&self) -> Vec<CookieRecord> {
        let mut records: Vec<CookieRecord> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (&a.domain, &a.path, &a.name).cmp(&(&b.domain, &b.path, &b.name))
        });
        records
    }

    /// Install a batch of records (session load).
    pub fn install(&self, records: &[CookieRecord]) {
        for r in records {
            self.set(&r.name, &r.value, &r.domain, &r.path);
        }
    }

    /// Install cookies from a `name=value; name2=value2` string (newlines
    /// tolerated). Returns how many cookies were set.
    pub fn set_from_cookie_string(&self, s: &str) -> Result<usize> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LoaderError::Auth("empty cookie string".to_string()));
        }
        let mut count = 0;
        for part in s.replace('\n', ";").split(';') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            self.set(name, value.trim(), DEFAULT_DOMAIN, "/");
            count += 1;
        }
        if count == 0 {
            return Err(LoaderError::Auth(
                "no cookies found in cookie string".to_string(),
            ));
        }
        Ok(count)
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path.starts_with(cookie_path)
}

fn parse_set_cookie(raw: &str, url: &Url) -> Option<CookieRecord> {
    let mut parts = raw.split(';');
    let first = parts.next()?;
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut domain = url.host_str().unwrap_or_default().to_string();
    let mut path = "/".to_string();
    for attr in parts {
        let (key, val) = attr
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .unwrap_or((attr.trim(), ""));
        match key.to_ascii_lowercase().as_str() {
            "domain" if !val.is_empty() => domain = val.to_ascii_lowercase(),
            "path" if !val.is_empty() => path = val.to_string(),
            _ => {}
        }
    }

    Some(CookieRecord {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain,
        path,
    })
}

impl CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                if let Some(record) = parse_set_cookie(raw, url) {
                    self.set(&record.name, &record.value, &record.domain, &record.path);
                }
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let host = url.host_str()?;
        let request_path = url.path();
        let mut pairs: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| domain_matches(host, &c.domain) && path_matches(request_path, &c.path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    version: String,
    uid: String,
    cookies: Vec<CookieRecord>,
}

/// File name of the session for a verified uid.
pub fn session_file_name(uid: &str) -> String {
    format!("session_{uid}.dat")
}

/// Persist the jar for a verified uid, atomically.
pub fn save_session(jar: &CookieJar, uid: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LoaderError::Init(format!("session dir: {e}")))?;
    }

    let payload = SessionFile {
        version: SESSION_VERSION.to_string(),
        uid: uid.to_string(),
        cookies: jar.snapshot(),
    };
    let json = serde_json::to_string(&payload)
        .map_err(|e| LoaderError::Init(format!("session serialize: {e}")))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| LoaderError::Init(format!("session temp file: {e}")))?;
    tmp.write_all(json.as_bytes())
        .map_err(|e| LoaderError::Init(format!("session write: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| LoaderError::Init(format!("session fsync: {e}")))?;
    tmp.persist(path)
        .map_err(|e| LoaderError::Init(format!("session rename: {e}")))?;

    debug!(uid, path = %path.display(), "session saved");
    Ok(())
}

/// Load a session file into the jar, returning the uid it was saved for.
/// A version mismatch rejects the file.
pub fn load_session(jar: &CookieJar, path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| LoaderError::Auth(format!("cannot read session {}: {e}", path.display())))?;
    let payload: SessionFile = serde_json::from_str(&contents)
        .map_err(|e| LoaderError::Auth(format!("corrupt session {}: {e}", path.display())))?;
    if payload.version != SESSION_VERSION {
        return Err(LoaderError::Auth(format!(
            "session version {} not supported (expected {})",
            payload.version, SESSION_VERSION
        )));
    }
    jar.install(&payload.cookies);
    Ok(payload.uid)
}

/// The most recently modified `session_{uid}.dat` under `dir`.
pub fn latest_session_file(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("session_") || !name.ends_with(".dat") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        match &newest {
            Some((when, _)) if *when >= modified => {}
            _ => newest = Some((modified, entry.path())),
        }
    }
    if newest.is_none() {
        warn!(dir = %dir.display(), "no session files found");
    }
    newest.map(|(_, path)| path)
}
