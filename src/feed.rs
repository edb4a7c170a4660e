//! Resumable paginated iteration over a target's posts.
//!
//! [`PostIterator`] pulls pages lazily from a [`PageFetcher`], deduplicates
//! by `mid`, and can be frozen into a [`CursorState`] at any point. The
//! recorded position always names the page whose contents are partially
//! consumed, so thawing refetches that page and the `seen_mids` filter
//! reproduces the exact unprocessed tail.

use crate::constants::{CHECKPOINT_VERSION, MAX_PAGES};
use crate::error::{LoaderError, Result};
use crate::resume::CursorState;
use crate::{cst, Post};
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// One fetched page of a feed.
#[derive(Debug, Clone)]
pub struct FeedPage {
    /// Posts in server order.
    pub posts: Vec<Post>,
    /// Cursor for the next page, when the feed uses cursors.
    pub next_cursor: Option<String>,
    /// Whether the server indicated more pages exist.
    pub has_more: bool,
}

/// Source of feed pages; implemented per target kind over the HTTP context.
pub trait PageFetcher {
    /// Fetch the page at `page`/`cursor`.
    fn fetch_page(&self, page: u32, cursor: Option<&str>) -> Result<FeedPage>;
}

/// Lazy, non-restartable iterator of unique posts.
pub struct PostIterator<F: PageFetcher> {
    fetcher: F,
    options_hash: String,
    page: u32,
    cursor: Option<String>,
    fetched_current: bool,
    staged: Option<(u32, Option<String>)>,
    seen: HashSet<String>,
    buffer: VecDeque<Post>,
    exhausted: bool,
    pages_fetched: u32,
    last_advance: Option<DateTime<FixedOffset>>,
}

impl<F: PageFetcher> PostIterator<F> {
    /// Create an iterator positioned at the first page.
    pub fn new(fetcher: F, options_hash: impl Into<String>) -> Self {
        Self {
            fetcher,
            options_hash: options_hash.into(),
            page: 1,
            cursor: None,
            fetched_current: false,
            staged: None,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            exhausted: false,
            pages_fetched: 0,
            last_advance: None,
        }
    }

    /// Snapshot the current position without advancing. Two freezes with no
    /// intervening advance serialize byte-identically.
    pub fn freeze(&self) -> CursorState {
        let mut seen_mids: Vec<String> = self.seen.iter().cloned().collect();
        seen_mids.sort();
        CursorState {
            version: CHECKPOINT_VERSION.to_string(),
            page: self.page,
            cursor: self.cursor.clone(),
            seen_mids,
            options_hash: self.options_hash.clone(),
            timestamp: self.last_advance.map(|d| d.to_rfc3339()),
        }
    }

    /// Restore a frozen position. Returns `false` (leaving the iterator
    /// untouched) when the state was produced under different options.
    pub fn thaw(&mut self, state: CursorState) -> bool {
        if state.options_hash != self.options_hash {
            warn!("checkpoint options hash mismatch, ignoring saved position");
            return false;
        }
        self.page = state.page;
        self.cursor = state.cursor;
        self.seen = state.seen_mids.into_iter().collect();
        self.last_advance = state
            .timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
        self.fetched_current = false;
        self.staged = None;
        self.buffer.clear();
        self.exhausted = false;
        true
    }

    /// Number of distinct mids yielded so far.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    fn refill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            if self.fetched_current {
                // Current page fully consumed; move to the staged position.
                match self.staged.take() {
                    Some((page, cursor)) => {
                        self.page = page;
                        self.cursor = cursor;
                        self.fetched_current = false;
                    }
                    None => {
                        self.exhausted = true;
                        break;
                    }
                }
                continue;
            }

            if self.pages_fetched >= MAX_PAGES {
                return Err(LoaderError::Target(format!(
                    "page limit ({MAX_PAGES}) exceeded, cursor may be looping"
                )));
            }

            let fetched = self.fetcher.fetch_page(self.page, self.cursor.as_deref())?;
            self.pages_fetched += 1;
            self.fetched_current = true;
            self.staged = fetched
                .has_more
                .then(|| (self.page + 1, fetched.next_cursor.clone()));

            let mut fresh = 0usize;
            for post in fetched.posts {
                if self.seen.contains(&post.mid) {
                    continue;
                }
                if self.buffer.iter().any(|p| p.mid == post.mid) {
                    continue;
                }
                self.buffer.push_back(post);
                fresh += 1;
            }
            debug!(page = self.page, fresh, "feed page fetched");
        }
        Ok(())
    }
}

impl<F: PageFetcher> Iterator for PostIterator<F> {
    type Item = Result<Post>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.refill() {
                return Some(Err(e));
            }
        }
        let post = self.buffer.pop_front()?;
        self.seen.insert(post.mid.clone());
        self.last_advance = Some(Utc::now().with_timezone(&cst()));
        Some(Ok(post))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn post(mid: &str) -> Post {
        Post {
            mid: mid.to_string(),
            bid: None,
            text: format!("text {mid}"),
            created_at: cst().with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            user: None,
            media_items: Vec::new(),
            raw: Value::Null,
        }
    }

    struct FakeFetcher {
        pages: Vec<Vec<&'static str>>,
    }

    impl FakeFetcher {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self { pages }
        }
    }

    impl PageFetcher for FakeFetcher {
        fn fetch_page(&self, page: u32, _cursor: Option<&str>) -> Result<FeedPage> {
            let idx = (page - 1) as usize;
            let posts = self
                .pages
                .get(idx)
                .map(|mids| mids.iter().map(|m| post(m)).collect())
                .unwrap_or_default();
            let has_more = idx + 1 < self.pages.len();
            Ok(FeedPage {
                posts,
                next_cursor: has_more.then(|| format!("c{}", page + 1)),
                has_more,
            })
        }
    }

    fn collect_mids<F: PageFetcher>(it: &mut PostIterator<F>) -> Vec<String> {
        it.map(|r| r.unwrap().mid).collect()
    }

    #[test]
    fn test_yields_all_pages_in_order() {
        let mut it = PostIterator::new(
            FakeFetcher::new(vec![vec!["1", "2"], vec!["3"], vec![]]),
            "h",
        );
        assert_eq!(collect_mids(&mut it), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_no_mid_yielded_twice() {
        let mut it = PostIterator::new(
            FakeFetcher::new(vec![vec!["1", "2", "2"], vec!["2", "3", "1"], vec![]]),
            "h",
        );
        assert_eq!(collect_mids(&mut it), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_freeze_is_idempotent() {
        let fetcher = FakeFetcher::new(vec![vec!["1", "2"], vec!["3"], vec![]]);
        let mut it = PostIterator::new(fetcher, "h");
        assert_eq!(it.next().unwrap().unwrap().mid, "1");

        let a = serde_json::to_string(&it.freeze()).unwrap();
        let b = serde_json::to_string(&it.freeze()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_thaw_resumes_exact_tail() {
        let mut original = PostIterator::new(
            FakeFetcher::new(vec![vec!["1", "2", "3"], vec!["4", "5"], vec![]]),
            "h",
        );
        // Consume two posts mid-page, then freeze.
        assert_eq!(original.next().unwrap().unwrap().mid, "1");
        assert_eq!(original.next().unwrap().unwrap().mid, "2");
        let frozen = original.freeze();
        let expected_tail = collect_mids(&mut original);

        let mut resumed = PostIterator::new(
            FakeFetcher::new(vec![vec!["1", "2", "3"], vec!["4", "5"], vec![]]),
            "h",
        );
        assert!(resumed.thaw(frozen));
        assert_eq!(collect_mids(&mut resumed), expected_tail);
        assert_eq!(expected_tail, vec!["3", "4", "5"]);
    }

    #[test]
    fn test_thaw_rejects_options_mismatch() {
        let mut it = PostIterator::new(FakeFetcher::new(vec![vec!["1"]]), "h");
        let mut state = it.freeze();
        state.options_hash = "other".to_string();
        assert!(!it.thaw(state));
    }

    #[test]
    fn test_thaw_skips_already_seen_posts() {
        let state = CursorState {
            version: CHECKPOINT_VERSION.to_string(),
            page: 1,
            cursor: None,
            seen_mids: vec!["1".to_string(), "2".to_string()],
            options_hash: "h".to_string(),
            timestamp: None,
        };
        let mut it = PostIterator::new(
            FakeFetcher::new(vec![vec!["1", "2", "3"], vec![]]),
            "h",
        );
        assert!(it.thaw(state));
        assert_eq!(collect_mids(&mut it), vec!["3"]);
    }

    #[test]
    fn test_seen_grows_monotonically() {
        let mut it = PostIterator::new(
            FakeFetcher::new(vec![vec!["1", "2"], vec!["3"], vec![]]),
            "h",
        );
        let mut last = 0;
        while let Some(r) = it.next() {
            r.unwrap();
            assert!(it.seen_count() >= last);
            last = it.seen_count();
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn test_fetch_error_is_surfaced() {
        struct Failing;
        impl PageFetcher for Failing {
            fn fetch_page(&self, _page: u32, _cursor: Option<&str>) -> Result<FeedPage> {
                Err(LoaderError::Target("boom".to_string()))
            }
        }
        let mut it = PostIterator::new(Failing, "h");
        assert!(matches!(it.next(), Some(Err(LoaderError::Target(_)))));
    }
}
