use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing between requests, shared by every worker holding the same
/// limiter. Callers reserve the next free slot under the lock and sleep
/// outside it, so waiting workers queue in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, next_slot: Mutex::new(None) }
    }

    pub fn min_interval(&self) -> Duration { self.min_interval }

    /// Wait until this caller may issue a request.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() { return; }
        let start = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            let start = match *slot {
                Some(next) if next > now => next,
                _ => now,
            };
            *slot = Some(start + self.min_interval);
            start
        };
        tokio::time::sleep_until(start).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn spaces_consecutive_requests() {
        let rl = RateLimiter::new(Duration::from_millis(30));
        let t0 = Instant::now();
        rl.acquire().await;
        rl.acquire().await;
        rl.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn shared_across_tasks() {
        let rl = Arc::new(RateLimiter::new(Duration::from_millis(25)));
        let t0 = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move { rl.acquire().await }));
        }
        for h in handles { h.await.unwrap(); }
        assert!(t0.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let rl = RateLimiter::new(Duration::ZERO);
        let t0 = Instant::now();
        for _ in 0..100 { rl.acquire().await; }
        assert!(t0.elapsed() < Duration::from_millis(50));
    }
}
