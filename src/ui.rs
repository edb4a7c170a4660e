//! Terminal progress sink built on `indicatif`.

use crate::events::{Event, EventKind, ProgressSink};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Spinner-based sink: transient status line plus one summary line per
/// target.
pub struct IndicatifSink {
    bar: ProgressBar,
}

impl IndicatifSink {
    /// Create a sink drawing to stderr.
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_draw_target(ProgressDrawTarget::stderr());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl Default for IndicatifSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifSink {
    fn emit(&self, event: &Event) {
        match event.kind {
            EventKind::Stage => {
                self.bar
                    .set_message(event.message.clone().unwrap_or_default());
            }
            EventKind::TargetStart => {
                self.bar.set_message(format!(
                    "Target: {}",
                    event.target_key.as_deref().unwrap_or("")
                ));
            }
            EventKind::MediaDone => {
                self.bar.set_message(format!(
                    "media {}/{}",
                    event.media_done.unwrap_or(0),
                    event.media_total.unwrap_or(0)
                ));
            }
            EventKind::PostDone => {
                self.bar.set_message(format!(
                    "posts processed: {}",
                    event.posts_processed.unwrap_or(0)
                ));
            }
            EventKind::LoginStatus => {
                self.bar
                    .println(event.message.clone().unwrap_or_default());
            }
            EventKind::TargetDone => {
                self.bar.set_message(String::new());
                let key = event.target_key.as_deref().unwrap_or("");
                let posts = event.posts_processed.unwrap_or(0);
                let downloaded = event.downloaded.unwrap_or(0);
                let skipped = event.skipped.unwrap_or(0);
                let failed = event.failed.unwrap_or(0);
                if failed > 0 {
                    self.bar.println(format!(
                        "✗ {key}: {posts} posts, {downloaded} downloaded, {failed} failed"
                    ));
                } else {
                    self.bar.println(format!(
                        "✓ {key}: {posts} posts, {downloaded} downloaded, {skipped} skipped"
                    ));
                }
            }
            EventKind::Interrupted => {
                self.bar.set_message(format!(
                    "Interrupted: {}",
                    event.target_key.as_deref().unwrap_or("")
                ));
            }
        }
    }

    fn close(&self) {
        self.bar.finish_and_clear();
    }

    fn pause(&self) {
        self.bar.set_draw_target(ProgressDrawTarget::hidden());
    }

    fn resume(&self) {
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
    }
}
