/// Fixed-window rate limiter for the login endpoint.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    max_attempts: u32,
    window: Duration,
}

struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_attempts,
            window,
        }
    }

    /// Record an attempt for `key`. Exactly `max_attempts` attempts per
    /// window succeed; the next one is rejected until the window rolls over.
    pub fn check_rate_limit(&self, key: &str) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();

        // Drop stale windows so one-off clients don't accumulate forever
        windows.retain(|_, w| now.duration_since(w.started) < self.window);

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.max_attempts {
            return false;
        }

        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_max_attempts_pass() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));

        for i in 0..10 {
            assert!(limiter.check_rate_limit("client-a"), "attempt {i}");
        }
        assert!(!limiter.check_rate_limit("client-a"));
        assert!(!limiter.check_rate_limit("client-a"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.check_rate_limit("client-a"));
        assert!(!limiter.check_rate_limit("client-a"));
        assert!(limiter.check_rate_limit("client-b"));
    }

    #[test]
    fn test_window_rollover_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));

        assert!(limiter.check_rate_limit("client-a"));
        assert!(!limiter.check_rate_limit("client-a"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check_rate_limit("client-a"));
    }
}
