//! Token-bucket rate limiting for reconciliation bursts.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// A token bucket: `accept` blocks the caller until a token is
/// available. Used to damp desired-state update storms.
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for the refill if none is available.
    pub async fn accept(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let refill = now.duration_since(bucket.last).as_secs_f64() * self.qps;
                bucket.tokens = (bucket.tokens + refill).min(self.burst);
                bucket.last = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };
            sleep(wait).await;
        }
    }
}
