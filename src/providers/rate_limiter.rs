// Rate limiter for portal requests
// Token bucket with burst support; one bucket guards the single upstream

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            capacity,
            refill_rate,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            Duration::from_secs(0)
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst_limit: u32) -> Self {
        let rate = f64::from(requests_per_minute) / 60.0;
        debug!(
            "Creating portal rate limiter: {} tokens/sec, {} capacity",
            rate, burst_limit
        );
        Self {
            bucket: Mutex::new(TokenBucket::new(f64::from(burst_limit), rate)),
        }
    }

    /// Wait until a request slot is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume() {
                    return;
                }
                bucket.time_until_available()
            };

            debug!("Portal rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
