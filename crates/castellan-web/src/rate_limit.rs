//! Sliding-window rate limiter shared by all web operations.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Admits at most `max_requests` within any trailing `window`. One `Mutex`
/// guards the timestamp list, so a shared instance is safe across threads.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(Vec::new()),
        }
    }

    /// Non-blocking admission check. Records the request when admitted.
    pub fn acquire(&self) -> bool {
        let now = Instant::now();
        let mut stamps = match self.timestamps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stamps.retain(|t| now.duration_since(*t) < self.window);
        if stamps.len() < self.max_requests {
            stamps.push(now);
            true
        } else {
            false
        }
    }

    /// Poll `acquire` until it succeeds or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_cap_then_refuses() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.acquire());
        assert!(limiter.acquire());
        assert!(limiter.acquire());
        assert!(!limiter.acquire());
    }

    #[test]
    fn old_timestamps_age_out() {
        let limiter = RateLimiter::new(2, Duration::from_millis(80));
        assert!(limiter.acquire());
        assert!(limiter.acquire());
        assert!(!limiter.acquire());
        std::thread::sleep(Duration::from_millis(120));
        assert!(limiter.acquire());
    }

    #[test]
    fn wait_gives_up_after_timeout() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.acquire());
        let started = Instant::now();
        assert!(!limiter.wait(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_succeeds_once_window_clears() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        assert!(limiter.acquire());
        assert!(limiter.wait(Duration::from_secs(2)));
    }
}
