//! Global token-bucket rate limiter guarding upstream calls.
//!
//! A single bucket shared by every worker. `acquire` either takes a
//! token immediately or sleeps until one would become available,
//! mirroring a blocking token bucket rather than a reject-on-empty one.

use std::time::Instant;

use tokio::sync::Mutex;

struct Bucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

/// Blocking token bucket: capacity and refill rate both equal `rate` tokens/second.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until a token is available, then consumes it.
    pub async fn acquire(&self) {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.rate).min(bucket.tokens + elapsed * bucket.rate);
            bucket.last_refill = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let wait_time = (1.0 - bucket.tokens) / bucket.rate;
            bucket.tokens = 0.0;
            wait_time
        };

        tokio::time::sleep(std::time::Duration::from_secs_f64(wait.max(0.0))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_capacity_waits() {
        let limiter = RateLimiter::new(2.0);
        limiter.acquire().await;
        limiter.acquire().await;
        let before = tokio::time::Instant::now();
        limiter.acquire().await;
        assert!(tokio::time::Instant::now() >= before);
    }
}
