use core::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Enforces a minimum period of `1 / max_per_second` between triggers.
///
/// Denied callers are expected to sleep briefly and ask again.
#[derive(Debug)]
pub struct RateLimiter {
    period: Option<Duration>,
    last_trigger: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `0` disables the limit.
    #[must_use]
    pub fn new(max_per_second: u32) -> Self {
        let period = (max_per_second > 0).then(|| Duration::from_secs(1) / max_per_second);
        Self {
            period,
            last_trigger: Mutex::new(None),
        }
    }

    /// Returns `true` and records a trigger if the period has elapsed.
    pub fn request_and_trigger(&self) -> bool {
        let Some(period) = self.period else {
            return true;
        };

        let now = Instant::now();
        let mut last = self.last_trigger.lock();
        if last.is_some_and(|at| now.duration_since(at) < period) {
            return false;
        }
        *last = Some(now);
        true
    }
}
