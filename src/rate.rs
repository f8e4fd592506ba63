use std::time::Duration;

use tokio::time::Instant;

/// Token bucket over datagram sends: one token per datagram, continuous
/// refill, a fixed burst cap.
///
/// The rate is steered multiplicatively by the data pump - down on send
/// buffer pressure, slightly up on every success - so it converges on
/// whatever the NIC and switch fabric sustain.
pub struct RateLimiter {
    tokens_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(tokens_per_sec: f64, burst: u32) -> RateLimiter {
        RateLimiter {
            tokens_per_sec,
            burst: burst as f64,
            // start with a full bucket so the first burst goes out unthrottled
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let missing = 1.0 - self.tokens;
            tokio::time::sleep(Duration::from_secs_f64(missing / self.tokens_per_sec)).await;
        }
    }

    /// Multiply the rate by `factor`. The floor keeps the wait arithmetic
    /// finite after long back-off cascades.
    pub fn scale(&mut self, factor: f64) {
        self.tokens_per_sec = (self.tokens_per_sec * factor).max(1e-6);
    }

    pub fn rate(&self) -> f64 {
        self.tokens_per_sec
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = (now - self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.burst);
    }
}
