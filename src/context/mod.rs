//! HTTP context for m.weibo.cn.
//!
//! Owns the blocking client, cookie jar and session lifecycle, and funnels
//! every outbound request through the rate controller:
//!
//! ```text
//! wait_before(bucket) -> send -> observe(bucket, status)
//!                                   |
//!                                   +-- 418 / captcha redirect?
//!                                          -> route to handler, retry once
//! ```
//!
//! Redirects are never followed automatically; CAPTCHA hops stay visible
//! and the nickname resolver reads `Location` itself.

pub mod captcha;
pub mod cookies;

use crate::adapter;
use crate::constants::{
    BASE_URL, CAPTCHA_TIMEOUT, DEFAULT_MAX_WORKERS, LOGIN_PROBE_TIMEOUT, REQUEST_TIMEOUT,
    USER_AGENT,
};
use crate::error::{LoaderError, Result};
use crate::events::ProgressSink;
use crate::ratecontrol::{Bucket, RateController};
use crate::shutdown::{self, SharedShutdown};
use crate::{Post, SuperTopic, User};
use captcha::{CaptchaHandler, CaptchaMode};
use cookies::CookieJar;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, LOCATION, REFERER};
use reqwest::redirect::Policy;
use reqwest::Method;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

static UID_PATH_RES: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"/u/(\d{5,})").expect("valid regex"),
        Regex::new(r"/profile/(\d{5,})").expect("valid regex"),
    ]
});
static ANY_UID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{5,}").expect("valid regex"));
static RENDER_DATA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$render_data\s*=\s*(\[[^\]]+\])\s*\[0\]").expect("valid regex"));
static STATUS_BLOB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""status"\s*:\s*(\{[^}]+\})"#).expect("valid regex"));

/// Result of login verification; never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStatus {
    /// The session is authenticated as `uid`.
    LoggedIn {
        /// Verified account id.
        uid: String,
    },
    /// The probe answered but reported no login.
    LoggedOut,
    /// The probe failed; nothing can be said about the session.
    Unknown,
}

/// Construction-time configuration of the context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Base URL; overridden in tests.
    pub base_url: String,
    /// CAPTCHA dispatch mode.
    pub captcha_mode: CaptchaMode,
    /// Ceiling on one CAPTCHA handler invocation.
    pub captcha_timeout: Duration,
    /// Default timeout of api requests.
    pub request_timeout: Duration,
    /// Connection pool sizing hint; must cover the media worker pool.
    pub max_workers: usize,
    /// Directory holding `session_{uid}.dat` files.
    pub session_dir: PathBuf,
    /// Explicit session file, overriding auto-discovery.
    pub session_path: Option<PathBuf>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            captcha_mode: CaptchaMode::Auto,
            captcha_timeout: CAPTCHA_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            max_workers: DEFAULT_MAX_WORKERS,
            session_dir: crate::constants::config_dir(),
            session_path: None,
        }
    }
}

/// Per-request knobs for [`WeiboContext::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Bucket the request is accounted against.
    pub bucket: Bucket,
    /// Whether a detected challenge may be routed to the handler.
    pub allow_captcha: bool,
    /// Retries on transport errors and retryable statuses.
    pub retries: u32,
    /// Total wall-clock timeout of the request, body read included.
    pub timeout: Duration,
    /// Return 3xx responses instead of treating them as errors.
    pub accept_redirects: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            bucket: Bucket::Api,
            allow_captcha: true,
            retries: 3,
            timeout: REQUEST_TIMEOUT,
            accept_redirects: false,
        }
    }
}

/// Shared HTTP context; cheap to share via [`Arc`] across the orchestrator
/// and media workers.
pub struct WeiboContext {
    client: Client,
    jar: Arc<CookieJar>,
    rate: Arc<dyn RateController>,
    sink: Arc<dyn ProgressSink>,
    captcha_handler: Box<dyn CaptchaHandler>,
    options: ContextOptions,
    shutdown: Option<SharedShutdown>,
}

impl WeiboContext {
    /// Build the context with a pooled blocking client.
    pub fn new(
        rate: Arc<dyn RateController>,
        sink: Arc<dyn ProgressSink>,
        options: ContextOptions,
    ) -> Result<Self> {
        let jar = Arc::new(CookieJar::new());

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(REFERER, HeaderValue::from_static("https://m.weibo.cn/"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .cookie_provider(jar.clone())
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(options.max_workers.max(DEFAULT_MAX_WORKERS))
            .build()
            .map_err(|e| LoaderError::Init(format!("http client: {e}")))?;

        Ok(Self {
            client,
            jar,
            rate,
            sink,
            captcha_handler: captcha::handler_for_mode(options.captcha_mode),
            options,
            shutdown: shutdown::get_global_shutdown(),
        })
    }

    /// The cookie jar backing this context.
    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    /// Default api request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.options.request_timeout
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.options.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    /// Issue a request under rate control, with retry, backoff and CAPTCHA
    /// routing. The response is returned unread so callers can stream it.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        opts: &RequestOptions,
    ) -> Result<Response> {
        let target = self.absolute_url(url);
        let mut captcha_attempted = false;
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown_requested() {
                return Err(LoaderError::Interrupted);
            }
            if !self.rate.wait_before(opts.bucket) {
                return Err(LoaderError::Interrupted);
            }

            let mut builder = self
                .client
                .request(method.clone(), &target)
                .timeout(opts.timeout);
            if !query.is_empty() {
                builder = builder.query(query);
            }

            let response = match builder.send() {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %target, attempt, error = %e, "transport error");
                    if attempt >= opts.retries {
                        return Err(LoaderError::Target(format!(
                            "request failed: {target}: {e}"
                        )));
                    }
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            self.rate.observe(opts.bucket, status);
            debug!(url = %target, status, attempt, "response");

            if opts.allow_captcha {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                if let Some(verify_url) =
                    captcha::extract_captcha_url(status, response.url().as_str(), location.as_deref())
                {
                    if captcha_attempted {
                        return Err(LoaderError::Auth("captcha not solved".to_string()));
                    }
                    captcha_attempted = true;
                    if self.solve_captcha(&verify_url) {
                        continue;
                    }
                    return Err(LoaderError::Auth("captcha not solved".to_string()));
                }
            }

            match status {
                403 | 418 => {
                    if attempt >= opts.retries {
                        return Err(LoaderError::RateLimit(format!("rate limited: {target}")));
                    }
                    // Backoff was armed by observe(); the next wait_before
                    // consumes it.
                    attempt += 1;
                }
                401 => return Err(LoaderError::Auth("authentication rejected".to_string())),
                500..=599 => {
                    if attempt >= opts.retries {
                        return Err(LoaderError::Target(format!(
                            "server error {status}: {target}"
                        )));
                    }
                    attempt += 1;
                }
                300..=399 if !opts.accept_redirects => {
                    return Err(LoaderError::Target(format!(
                        "unexpected redirect {status}: {target}"
                    )));
                }
                s if s >= 400 => {
                    return Err(LoaderError::Target(format!("http {s}: {target}")));
                }
                _ => return Ok(response),
            }
        }
    }

    fn solve_captcha(&self, verify_url: &str) -> bool {
        info!(url = verify_url, "captcha challenge detected");
        self.sink.pause();
        let solved = self
            .captcha_handler
            .solve(verify_url, self.options.captcha_timeout);
        self.sink.resume();
        if !solved {
            warn!(url = verify_url, "captcha not solved");
        }
        solved
    }

    fn get_json(&self, url: &str, query: &[(&str, String)], opts: &RequestOptions) -> Result<Value> {
        let response = self.request(Method::GET, url, query, opts)?;
        response
            .json()
            .map_err(|e| LoaderError::ApiSchema(format!("invalid JSON from {url}: {e}")))
    }

    fn get_index(&self, params: &[(&str, String)]) -> Result<Value> {
        let payload = self.get_json(
            "/api/container/getIndex",
            params,
            &RequestOptions::default(),
        )?;
        match payload.get("data") {
            Some(data) if data.is_object() => Ok(data.clone()),
            _ => {
                let msg = payload
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("api error");
                Err(LoaderError::Target(msg.to_string()))
            }
        }
    }

    /// Resolve a nickname to a uid via the `/n/{nickname}` redirect.
    pub fn resolve_nickname_to_uid(&self, nickname: &str) -> Result<String> {
        let path = format!("/n/{}", urlencoding::encode(nickname.trim()));
        let opts = RequestOptions {
            retries: 2,
            accept_redirects: true,
            ..RequestOptions::default()
        };

        let response = self.request(Method::GET, &path, &[], &opts)?;
        let final_url = response.url().to_string();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        drop(response);

        if let Some(uid) = location.as_deref().and_then(extract_uid) {
            return Ok(uid);
        }

        // Follow the redirect once by hand and grep the landing page.
        if let Some(location) = location {
            let next = Url::parse(&final_url)
                .ok()
                .and_then(|base| base.join(&location).ok())
                .map(|u| u.to_string())
                .unwrap_or(location);
            let response = self.request(Method::GET, &next, &[], &opts)?;
            let landed = response.url().to_string();
            let body = response.text().unwrap_or_default();
            if let Some(uid) = extract_uid(&landed).or_else(|| extract_uid(&body)) {
                return Ok(uid);
            }
        } else if let Some(uid) = extract_uid(&final_url) {
            return Ok(uid);
        }

        Err(LoaderError::Target(format!(
            "cannot resolve nickname: {nickname}"
        )))
    }

    /// Fetch profile information for a uid.
    pub fn get_user_info(&self, uid: &str) -> Result<User> {
        let data = self.get_index(&[
            ("type", "uid".to_string()),
            ("value", uid.to_string()),
        ])?;

        let user = data
            .get("userInfo")
            .or_else(|| data.get("user"))
            .filter(|u| u.is_object())
            .cloned()
            .or_else(|| {
                data.get("cards")
                    .and_then(Value::as_array)
                    .and_then(|cards| {
                        cards
                            .iter()
                            .find_map(|c| c.get("user").filter(|u| u.is_object()).cloned())
                    })
            })
            .ok_or_else(|| LoaderError::Target(format!("user not found: {uid}")))?;

        adapter::parse_user(&user)
    }

    /// One page of a user's feed.
    pub fn get_user_posts(
        &self,
        uid: &str,
        page: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<Post>, Option<String>)> {
        let mut params = vec![
            ("containerid", format!("107603{uid}")),
            ("page", page.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("since_id", cursor.to_string()));
        }
        let data = self.get_index(&params)?;
        Ok((
            adapter::parse_feed_posts(&data),
            adapter::extract_next_cursor(&data),
        ))
    }

    /// One page of a super-topic feed.
    pub fn get_supertopic_posts(
        &self,
        containerid: &str,
        page: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<Post>, Option<String>)> {
        let containerid = if containerid.ends_with("_-_feed") {
            containerid.to_string()
        } else {
            format!("{containerid}_-_feed")
        };
        let mut params = vec![("containerid", containerid), ("page", page.to_string())];
        if let Some(cursor) = cursor {
            params.push(("since_id", cursor.to_string()));
        }
        let data = self.get_index(&params)?;
        Ok((
            adapter::parse_feed_posts(&data),
            adapter::extract_next_cursor(&data),
        ))
    }

    /// Search for super-topics by keyword.
    pub fn search_supertopics(&self, keyword: &str) -> Result<Vec<SuperTopic>> {
        let data = self.get_index(&[(
            "containerid",
            format!("100103type=98&q={keyword}"),
        )])?;

        let mut topics = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for card in data.get("cards").and_then(Value::as_array).into_iter().flatten() {
            let mut raw = card.clone();
            if raw.get("containerid").is_none() {
                let scheme = card.get("scheme").and_then(Value::as_str).unwrap_or("");
                if let Some(cid) = scheme
                    .split("containerid=")
                    .nth(1)
                    .map(|rest| rest.split('&').next().unwrap_or(rest))
                {
                    if let Some(obj) = raw.as_object_mut() {
                        obj.insert("containerid".to_string(), Value::String(cid.to_string()));
                    }
                }
            }
            if raw.get("topic_title").is_none() {
                let title = card
                    .get("title_sub")
                    .or_else(|| card.get("title"))
                    .and_then(Value::as_str)
                    .map(|t| t.trim_matches(['#', ' ']).to_string());
                if let (Some(title), Some(obj)) = (title, raw.as_object_mut()) {
                    obj.insert("topic_title".to_string(), Value::String(title));
                }
            }
            if let Ok(topic) = adapter::parse_supertopic(&raw) {
                if seen.insert(topic.containerid.clone()) {
                    topics.push(topic);
                }
            }
        }
        Ok(topics)
    }

    /// One page of post search results.
    pub fn search_posts(
        &self,
        keyword: &str,
        page: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<Post>, Option<String>)> {
        let mut params = vec![
            ("containerid", format!("100103type=1&q={keyword}")),
            ("page", page.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("since_id", cursor.to_string()));
        }
        let data = self.get_index(&params)?;
        Ok((
            adapter::parse_feed_posts(&data),
            adapter::extract_next_cursor(&data),
        ))
    }

    /// Fetch a single post by mid, trying the detail page first and the
    /// status API as fallback.
    pub fn get_post_by_mid(&self, mid: &str) -> Result<Post> {
        let opts = RequestOptions {
            retries: 2,
            ..RequestOptions::default()
        };
        let response = self.request(Method::GET, &format!("/detail/{mid}"), &[], &opts)?;
        let html = response.text().unwrap_or_default();

        if let Some(status) = extract_status_from_html(&html) {
            return adapter::parse_post(&status);
        }

        let payload = self.get_json(
            "/api/statuses/show",
            &[("id", mid.to_string())],
            &RequestOptions::default(),
        )?;
        let status = payload.get("data").filter(|d| d.is_object()).unwrap_or(&payload);
        if status.is_object() {
            return adapter::parse_post(status);
        }
        Err(LoaderError::Target(format!("post not found: {mid}")))
    }

    /// Probe `/api/config` to classify the session. Never errors.
    pub fn verify_login(&self) -> LoginStatus {
        let opts = RequestOptions {
            retries: 1,
            allow_captcha: false,
            timeout: LOGIN_PROBE_TIMEOUT,
            ..RequestOptions::default()
        };
        let payload: Value = match self.request(Method::GET, "/api/config", &[], &opts) {
            Ok(response) => match response.json() {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "login probe returned invalid JSON");
                    return LoginStatus::Unknown;
                }
            },
            Err(e) => {
                debug!(error = %e, "login probe failed");
                return LoginStatus::Unknown;
            }
        };

        let data = payload.get("data");
        match data.and_then(|d| d.get("login")).and_then(Value::as_bool) {
            Some(true) => {
                let uid = data
                    .and_then(|d| d.get("uid"))
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                if uid.is_empty() {
                    LoginStatus::Unknown
                } else {
                    LoginStatus::LoggedIn { uid }
                }
            }
            Some(false) => LoginStatus::LoggedOut,
            None => LoginStatus::Unknown,
        }
    }

    /// Install cookies from a `name=value; ...` string.
    pub fn set_cookies_from_string(&self, s: &str) -> Result<()> {
        let count = self.jar.set_from_cookie_string(s)?;
        info!(count, "cookies installed from string");
        Ok(())
    }

    /// Install cookies from a file containing a cookie string.
    pub fn set_cookies_from_file(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LoaderError::Init(format!("cannot read {}: {e}", path.display())))?;
        self.set_cookies_from_string(&contents)
    }

    /// Hit the mobile site once so it mints visitor cookies into the jar.
    pub fn fetch_visitor_cookies(&self) -> Result<()> {
        let opts = RequestOptions {
            retries: 1,
            allow_captcha: false,
            accept_redirects: true,
            ..RequestOptions::default()
        };
        let response = self.request(Method::GET, "/", &[], &opts)?;
        drop(response);
        if self.jar.snapshot().is_empty() {
            return Err(LoaderError::Auth(
                "site issued no visitor cookies".to_string(),
            ));
        }
        info!("visitor cookies installed");
        Ok(())
    }

    /// Whether the jar carries a non-empty `SUB` credential.
    pub fn has_sub_cookie(&self) -> bool {
        self.jar.get("SUB").map_or(false, |v| !v.is_empty())
    }

    /// Load a session: the explicit path when configured, otherwise the most
    /// recently modified `session_{uid}.dat` in the session directory.
    /// Returns the session's uid when one was loaded.
    pub fn load_session(&self) -> Option<String> {
        let path = self
            .options
            .session_path
            .clone()
            .or_else(|| cookies::latest_session_file(&self.options.session_dir))?;
        match cookies::load_session(&self.jar, &path) {
            Ok(uid) => {
                info!(uid, path = %path.display(), "session loaded");
                Some(uid)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "session not loaded");
                None
            }
        }
    }

    /// Persist the session for a verified uid. Only called after
    /// [`WeiboContext::verify_login`] reported `LoggedIn`.
    pub fn save_session(&self, uid: &str) -> Result<PathBuf> {
        let path = self
            .options
            .session_path
            .clone()
            .unwrap_or_else(|| self.options.session_dir.join(cookies::session_file_name(uid)));
        cookies::save_session(&self.jar, uid, &path)?;
        Ok(path)
    }
}

/// Pull a uid out of a URL or free-form text: query parameters first, then
/// profile paths, then any long digit run.
fn extract_uid(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(text)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| text.to_string());

    if let Ok(parsed) = Url::parse(&decoded) {
        for key in ["uid", "value", "id"] {
            if let Some((_, v)) = parsed.query_pairs().find(|(k, _)| k == key) {
                if !v.is_empty() {
                    return Some(v.into_owned());
                }
            }
        }
        for re in UID_PATH_RES.iter() {
            if let Some(caps) = re.captures(parsed.path()) {
                return Some(caps[1].to_string());
            }
        }
    }

    ANY_UID_RE
        .find(&decoded)
        .map(|m| m.as_str().to_string())
}

/// Dig the embedded status JSON out of a `/detail/{mid}` HTML page.
fn extract_status_from_html(html: &str) -> Option<Value> {
    if html.is_empty() {
        return None;
    }
    if let Some(caps) = RENDER_DATA_RE.captures(html) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&caps[1]) {
            if let Some(first) = items.first() {
                if let Some(status) = first.get("status") {
                    if status.is_object() {
                        return Some(status.clone());
                    }
                }
            }
        }
    }
    if let Some(caps) = STATUS_BLOB_RE.captures(html) {
        if let Ok(status) = serde_json::from_str::<Value>(&caps[1]) {
            if status.is_object() {
                return Some(status);
            }
        }
    }
    None
}
