//! Rate limiting with sliding windows and reactive exponential backoff.
//!
//! Two independent buckets gate outbound traffic: `api` for JSON endpoints
//! and `media` for file downloads. Each bucket keeps a ring of request
//! timestamps bounded by its window; 403/418 responses arm a one-shot
//! backoff consumed by the next wait. Buckets never share quota.

use crate::shutdown::{self, SharedShutdown};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Traffic class a request is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// JSON API endpoints.
    Api,
    /// Media file downloads.
    Media,
}

impl Bucket {
    fn idx(self) -> usize {
        match self {
            Bucket::Api => 0,
            Bucket::Media => 1,
        }
    }

    /// Lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Api => "api",
            Bucket::Media => "media",
        }
    }
}

/// Gate and observation interface; implementations must be shareable across
/// the orchestrator and media workers.
pub trait RateController: Send + Sync {
    /// Block until a request in `bucket` is allowed, then consume a slot.
    ///
    /// Returns `false` when the wait was interrupted by shutdown; no slot is
    /// consumed in that case and the caller must abort the request.
    fn wait_before(&self, bucket: Bucket) -> bool;

    /// Record the response status for `bucket`. 403/418 arm backoff, any
    /// 2xx clears it.
    fn observe(&self, bucket: Bucket, status: u16);
}

/// Window and backoff parameters.
#[derive(Debug, Clone)]
pub struct RateLimits {
    /// Maximum api requests per window.
    pub api_limit: usize,
    /// Sliding window for the api bucket.
    pub api_window: Duration,
    /// Maximum media requests per window.
    pub media_limit: usize,
    /// Sliding window for the media bucket.
    pub media_window: Duration,
    /// First backoff delay after a failure.
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
    /// Fraction of the backoff added as uniform random jitter.
    pub jitter_ratio: f64,
    /// Minimum spacing between api requests.
    pub request_interval: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            api_limit: 30,
            api_window: Duration::from_secs(600),
            media_limit: 30,
            media_window: Duration::from_secs(600),
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            jitter_ratio: 0.5,
            request_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct BucketState {
    timestamps: VecDeque<Instant>,
    last_request: Option<Instant>,
    failures: u32,
    backoff_until: Option<Instant>,
}

/// Default [`RateController`]: per-bucket sliding windows plus reactive
/// exponential backoff with jitter.
pub struct SlidingWindowRateController {
    limits: RateLimits,
    state: Mutex<[BucketState; 2]>,
    shutdown: Option<SharedShutdown>,
}

impl SlidingWindowRateController {
    /// Create a controller with the given limits, picking up the global
    /// shutdown handle when one is installed.
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new([BucketState::default(), BucketState::default()]),
            shutdown: shutdown::get_global_shutdown(),
        }
    }

    /// Attach an explicit shutdown handle (used by tests and embedders).
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn bucket_limits(&self, bucket: Bucket) -> (usize, Duration) {
        match bucket {
            Bucket::Api => (self.limits.api_limit, self.limits.api_window),
            Bucket::Media => (self.limits.media_limit, self.limits.media_window),
        }
    }

    fn interruptible_sleep(&self, dur: Duration) -> bool {
        match &self.shutdown {
            Some(s) => s.sleep(dur),
            None => {
                std::thread::sleep(dur);
                true
            }
        }
    }
}

impl RateController for SlidingWindowRateController {
    fn wait_before(&self, bucket: Bucket) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let (limit, window) = self.bucket_limits(bucket);
                let st = &mut state[bucket.idx()];
                let now = Instant::now();

                while let Some(&front) = st.timestamps.front() {
                    if now.duration_since(front) >= window {
                        st.timestamps.pop_front();
                    } else {
                        break;
                    }
                }

                let mut wait = Duration::ZERO;
                if st.timestamps.len() >= limit {
                    if let Some(&front) = st.timestamps.front() {
                        wait = wait.max(window.saturating_sub(now.duration_since(front)));
                    }
                }
                if bucket == Bucket::Api && !self.limits.request_interval.is_zero() {
                    if let Some(last) = st.last_request {
                        wait = wait.max(
                            self.limits
                                .request_interval
                                .saturating_sub(now.duration_since(last)),
                        );
                    }
                }
                if let Some(until) = st.backoff_until {
                    if until > now {
                        wait = wait.max(until - now);
                    }
                }

                if wait.is_zero() {
                    // Slot taken while the lock is held, so concurrent
                    // callers cannot overshoot the window.
                    st.timestamps.push_back(now);
                    st.last_request = Some(now);
                    return true;
                }
                wait
            };

            debug!(bucket = bucket.as_str(), wait_ms = wait.as_millis() as u64, "rate gate");
            if !self.interruptible_sleep(wait) {
                return false;
            }
        }
    }

    fn observe(&self, bucket: Bucket, status: u16) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let st = &mut state[bucket.idx()];
        match status {
            403 | 418 => {
                st.failures += 1;
                let exp = st.failures.saturating_sub(1).min(16);
                let base = self.limits.base_delay.as_secs_f64() * 2f64.powi(exp as i32);
                let capped = base.min(self.limits.max_delay.as_secs_f64());
                let jitter = capped * self.limits.jitter_ratio * rand::thread_rng().gen::<f64>();
                st.backoff_until = Some(Instant::now() + Duration::from_secs_f64(capped + jitter));
                warn!(
                    bucket = bucket.as_str(),
                    status,
                    failures = st.failures,
                    backoff_secs = capped + jitter,
                    "throttled, arming backoff"
                );
            }
            200..=399 => {
                st.failures = 0;
                st.backoff_until = None;
            }
            _ => {}
        }
    }
}
