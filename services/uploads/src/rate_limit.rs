use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Buckets kept before expired ones are swept
const MAX_BUCKETS: usize = 10_000;

/// Fixed-window counter for one user
#[derive(Debug, Clone)]
struct RateLimitBucket {
    count: u32,
    reset_at: Instant,
}

impl RateLimitBucket {
    fn new(window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: Instant::now() + window,
        }
    }

    fn check_and_increment(&mut self, limit: u32, window: Duration) -> (bool, u32) {
        let now = Instant::now();

        // Reset if window expired
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + window;
        }

        if self.count < limit {
            self.count += 1;
            (true, limit.saturating_sub(self.count))
        } else {
            (false, 0)
        }
    }

    fn reset_in(&self) -> Duration {
        self.reset_at.saturating_duration_since(Instant::now())
    }
}

/// Per-user upload limiter
///
/// Each user gets `limit` uploads per `window`. A limit of zero turns the
/// limiter off.
#[derive(Debug)]
pub struct UploadRateLimiter {
    buckets: Mutex<HashMap<i32, RateLimitBucket>>,
    limit: u32,
    window: Duration,
}

impl UploadRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one upload for `owner_id`.
    ///
    /// Returns the uploads left in the window, or how long until the window
    /// resets when the user is over the limit.
    pub async fn check(&self, owner_id: i32) -> Result<u32, Duration> {
        if self.limit == 0 {
            return Ok(u32::MAX);
        }

        let mut buckets = self.buckets.lock().await;

        if buckets.len() >= MAX_BUCKETS {
            let now = Instant::now();
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.reset_at > now);
            debug!(removed = before - buckets.len(), "Swept expired rate limit buckets");
        }

        let bucket = buckets
            .entry(owner_id)
            .or_insert_with(|| RateLimitBucket::new(self.window));

        match bucket.check_and_increment(self.limit, self.window) {
            (true, remaining) => Ok(remaining),
            (false, _) => Err(bucket.reset_in()),
        }
    }
}
