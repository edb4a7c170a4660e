//! Progress event bus.
//!
//! The engine emits structured events; sinks render them. A sink can never
//! break the engine: emissions are panic-isolated and a [`NullSink`] is
//! always acceptable.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A coarse phase change (resolving, fetching cookies, ...).
    Stage,
    /// A target's run began.
    TargetStart,
    /// One media job of a post finished.
    MediaDone,
    /// A post was fully resolved.
    PostDone,
    /// A target's run finished, with aggregate counts.
    TargetDone,
    /// The user interrupted the run.
    Interrupted,
    /// Result of login verification.
    LoginStatus,
}

/// Outcome of one media job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOutcome {
    /// File was fetched and finalized.
    Downloaded,
    /// Destination already existed with content; no network call was made.
    Skipped,
    /// The job failed or was cancelled.
    Failed,
}

impl MediaOutcome {
    /// Lowercase label used in logs and summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaOutcome::Downloaded => "downloaded",
            MediaOutcome::Skipped => "skipped",
            MediaOutcome::Failed => "failed",
        }
    }
}

/// One progress event. Fields are populated per kind; absent ones stay
/// `None`.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Free-form message (`Stage`, `LoginStatus`).
    pub message: Option<String>,
    /// Target this event belongs to.
    pub target_key: Option<String>,
    /// Outcome of a finished media job.
    pub outcome: Option<MediaOutcome>,
    /// Media jobs finished so far within the post, strictly increasing.
    pub media_done: Option<usize>,
    /// Total media jobs of the post.
    pub media_total: Option<usize>,
    /// 1-based index of the post within the target run.
    pub post_index: Option<usize>,
    /// Destination filename of a finished media job.
    pub filename: Option<String>,
    /// Posts fully resolved so far within the target run.
    pub posts_processed: Option<usize>,
    /// Files downloaded in this target run.
    pub downloaded: Option<usize>,
    /// Files skipped in this target run.
    pub skipped: Option<usize>,
    /// Files failed in this target run.
    pub failed: Option<usize>,
    /// Whether the target run completed without failures.
    pub ok: Option<bool>,
}

impl Event {
    /// An event of `kind` with every payload field unset.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            message: None,
            target_key: None,
            outcome: None,
            media_done: None,
            media_total: None,
            post_index: None,
            filename: None,
            posts_processed: None,
            downloaded: None,
            skipped: None,
            failed: None,
            ok: None,
        }
    }
}

/// Receives progress events. Implementations must tolerate being called
/// from the orchestrator thread at any point of a run.
pub trait ProgressSink: Send + Sync {
    /// Render one event.
    fn emit(&self, event: &Event);

    /// Flush and tear down any terminal state.
    fn close(&self) {}

    /// Temporarily stop rendering (a CAPTCHA handler owns the terminal).
    fn pause(&self) {}

    /// Resume rendering after [`ProgressSink::pause`].
    fn resume(&self) {}
}

/// Sink that ignores every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

/// Emit `event` into `sink`, swallowing panics so a broken sink cannot take
/// down the engine.
pub fn safe_emit(sink: &dyn ProgressSink, event: &Event) {
    if catch_unwind(AssertUnwindSafe(|| sink.emit(event))).is_err() {
        debug!("progress sink panicked during emit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PanickingSink;
    impl ProgressSink for PanickingSink {
        fn emit(&self, _event: &Event) {
            panic!("sink exploded");
        }
    }

    struct CountingSink(AtomicUsize);
    impl ProgressSink for CountingSink {
        fn emit(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_safe_emit_swallows_sink_panics() {
        let sink = PanickingSink;
        safe_emit(&sink, &Event::new(EventKind::Stage));
        // Reaching this line is the assertion.
    }

    #[test]
    fn test_safe_emit_delivers() {
        let sink = CountingSink(AtomicUsize::new(0));
        safe_emit(&sink, &Event::new(EventKind::PostDone));
        safe_emit(&sink, &Event::new(EventKind::TargetDone));
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(MediaOutcome::Downloaded.as_str(), "downloaded");
        assert_eq!(MediaOutcome::Skipped.as_str(), "skipped");
        assert_eq!(MediaOutcome::Failed.as_str(), "failed");
    }
}
