//! Token bucket pacing for operation dispatch.
//!
//! The applier takes one token before dispatching each operation, so the
//! dispatch rate towards the control plane is bounded independently of the
//! worker pool size.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, interval: Duration, burst: u32) {
        if self.tokens >= burst {
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (elapsed.as_nanos() / interval.as_nanos()).min(burst as u128) as u32;
        if earned == 0 {
            return;
        }

        self.tokens = (self.tokens + earned).min(burst);
        self.last_refill = if self.tokens >= burst {
            now
        } else {
            self.last_refill + interval * earned
        };
    }
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let burst = config.burst.max(1);
        Self {
            interval: config.interval(),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(&RateLimitConfig::unlimited())
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval.is_zero()
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                bucket.refill(now, self.interval, self.burst);
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                self.interval
                    .saturating_sub(now.saturating_duration_since(bucket.last_refill))
            };

            trace!("Rate limited, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
