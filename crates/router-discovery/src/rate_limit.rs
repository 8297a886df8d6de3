//! Token bucket limiter, constructed once and passed to whatever needs it

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,       // tokens per second
    max_tokens: f64, // burst capacity
}

impl TokenBucket {
    fn new(rate: f64, max_tokens: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            rate,
            max_tokens,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
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

    fn wait_time(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    requests_per_minute: u32,
}

impl RateLimiter {
    /// Allows `requests_per_minute` sustained, with the same number as burst.
    /// A zero rate is treated as one request per minute.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let per_minute = requests_per_minute.max(1);
        Self {
            bucket: Mutex::new(TokenBucket::new(
                f64::from(per_minute) / 60.0,
                f64::from(per_minute),
            )),
            requests_per_minute: per_minute,
        }
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner()).try_consume()
    }

    /// Wait until a token is available, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                if bucket.try_consume() {
                    return;
                }
                bucket.wait_time()
            };
            debug!("Rate limited, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::per_minute(2);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_a_token() {
        let limiter = RateLimiter::per_minute(60);
        for _ in 0..60 {
            assert!(limiter.try_acquire());
        }

        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(1100), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn test_zero_rate_is_clamped() {
        assert_eq!(RateLimiter::per_minute(0).requests_per_minute(), 1);
    }
}
