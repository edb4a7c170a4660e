//! CAPTCHA challenge detection and handlers.
//!
//! Detection is URL-based: HTTP 418, or a redirect whose location matches
//! the verification host patterns. Solving is manual or browser-assisted;
//! the engine never attempts to solve a challenge itself. Handlers are
//! bounded by a timeout so an unattended terminal cannot hang a run, and
//! a timeout aborts only the current target.

use std::io::BufRead;
use std::process::Command;
use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Substrings of host+path that mark a verification page.
const CAPTCHA_URL_HINTS: [&str; 5] = [
    "passport.weibo",
    "login.sina",
    "verify",
    "captcha",
    "challenge",
];

/// How a detected challenge is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaMode {
    /// Browser-assisted when an opener is available, manual otherwise.
    Auto,
    /// Open the verification URL in the system browser, then wait.
    Browser,
    /// Print the verification URL and wait for confirmation.
    Manual,
    /// Never solve; the target fails immediately.
    Skip,
}

impl FromStr for CaptchaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(CaptchaMode::Auto),
            "browser" => Ok(CaptchaMode::Browser),
            "manual" => Ok(CaptchaMode::Manual),
            "skip" => Ok(CaptchaMode::Skip),
            _ => Err(format!(
                "invalid captcha mode: {s}. Valid options: auto, browser, manual, skip"
            )),
        }
    }
}

impl std::fmt::Display for CaptchaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaptchaMode::Auto => "auto",
            CaptchaMode::Browser => "browser",
            CaptchaMode::Manual => "manual",
            CaptchaMode::Skip => "skip",
        };
        write!(f, "{s}")
    }
}

/// Resolves a verification challenge out-of-band.
pub trait CaptchaHandler: Send + Sync {
    /// Returns `true` once the challenge is believed solved. Must return
    /// within `timeout`.
    fn solve(&self, verify_url: &str, timeout: Duration) -> bool;
}

/// Prints the verification URL and waits for the user to confirm with
/// Enter.
pub struct ManualCaptchaHandler;

impl CaptchaHandler for ManualCaptchaHandler {
    fn solve(&self, verify_url: &str, timeout: Duration) -> bool {
        eprintln!("CAPTCHA verification required: {verify_url}");
        eprintln!(
            "Open the URL, complete the challenge, then press Enter (within {}s)...",
            timeout.as_secs()
        );
        wait_for_enter(timeout)
    }
}

/// Opens the verification URL in the system browser, then waits for the
/// user to confirm. Falls back to the manual prompt when no opener exists.
pub struct BrowserCaptchaHandler;

impl CaptchaHandler for BrowserCaptchaHandler {
    fn solve(&self, verify_url: &str, timeout: Duration) -> bool {
        if open_in_browser(verify_url) {
            info!(url = verify_url, "opened verification page in browser");
            eprintln!(
                "Complete the challenge in your browser, then press Enter (within {}s)...",
                timeout.as_secs()
            );
            wait_for_enter(timeout)
        } else {
            warn!("no browser opener available, falling back to manual prompt");
            ManualCaptchaHandler.solve(verify_url, timeout)
        }
    }
}

/// Fails every challenge without user interaction.
pub struct SkipCaptchaHandler;

impl CaptchaHandler for SkipCaptchaHandler {
    fn solve(&self, _verify_url: &str, _timeout: Duration) -> bool {
        false
    }
}

/// Build the handler for a mode. `Auto` behaves like `Browser`, which
/// itself degrades to the manual prompt when no opener exists.
pub fn handler_for_mode(mode: CaptchaMode) -> Box<dyn CaptchaHandler> {
    match mode {
        CaptchaMode::Manual => Box::new(ManualCaptchaHandler),
        CaptchaMode::Skip => Box::new(SkipCaptchaHandler),
        CaptchaMode::Auto | CaptchaMode::Browser => Box::new(BrowserCaptchaHandler),
    }
}

fn wait_for_enter(timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_ok() {
            let _ = tx.send(());
        }
    });
    rx.recv_timeout(timeout).is_ok()
}

fn open_in_browser(url: &str) -> bool {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "explorer"
    } else {
        "xdg-open"
    };
    Command::new(opener).arg(url).spawn().is_ok()
}

/// Whether a URL points at a verification page.
pub fn is_captcha_url(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(raw) else {
        return false;
    };
    let text = format!(
        "{}{}",
        parsed.host_str().unwrap_or_default(),
        parsed.path()
    )
    .to_lowercase();
    CAPTCHA_URL_HINTS.iter().any(|hint| text.contains(hint))
}

/// Decide whether a response is a CAPTCHA challenge and extract the
/// verification URL: HTTP 418 on a verification URL, a final URL matching
/// the patterns, or a redirect `Location` (possibly relative) that does.
pub fn extract_captcha_url(
    status: u16,
    final_url: &str,
    location: Option<&str>,
) -> Option<String> {
    if status == 418 {
        return is_captcha_url(final_url).then(|| final_url.to_string());
    }
    if is_captcha_url(final_url) {
        return Some(final_url.to_string());
    }
    if let Some(location) = location {
        let absolute = Url::parse(final_url)
            .ok()
            .and_then(|base| base.join(location).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| location.to_string());
        if is_captcha_url(&absolute) {
            return Some(absolute);
        }
    }
    None
}
