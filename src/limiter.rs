//! # Rate & concurrency control
//!
//! Two independent limits:
//! - [`RateLimiter`]: a per-user sliding window (default 10 requests / 60 s).
//!   A rejected request leaves no trace except the caller's rate-limited counter.
//! - [`ConcurrencyGate`]: a semaphore capping simultaneous outbound calls to the
//!   generative service, however many users were admitted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

/// Per-user sliding-window admission.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    max_tracked_users: usize,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, max_tracked_users: usize) -> Self {
        Self {
            max_requests,
            window,
            max_tracked_users: max_tracked_users.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `user_id` if their window has room.
    ///
    /// Timestamps older than the window are dropped before the check. A
    /// rejected request is not recorded.
    pub fn try_admit(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        if windows.len() >= self.max_tracked_users && !windows.contains_key(user_id) {
            let window = self.window;
            windows.retain(|_, stamps| {
                stamps
                    .back()
                    .is_some_and(|last| now.saturating_duration_since(*last) <= window)
            });
            debug!(tracked = windows.len(), "pruned idle rate windows");
        }

        let stamps = windows.entry(user_id.to_string()).or_default();
        while let Some(front) = stamps.front() {
            if now.saturating_duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.max_requests {
            return false;
        }

        stamps.push_back(now);
        true
    }

    /// Requests still available to `user_id` in the current window.
    pub fn remaining(&self, user_id: &str) -> usize {
        let now = Instant::now();
        let windows = self.windows.lock();
        let used = windows.get(user_id).map_or(0, |stamps| {
            stamps
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < self.window)
                .count()
        });
        self.max_requests.saturating_sub(used)
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Cap on simultaneous generative calls.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.semaphore.acquire().await
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_request_rejected() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60), 100);
        for i in 0..10 {
            assert!(limiter.try_admit("alice"), "request {} should pass", i + 1);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(!limiter.try_admit("alice"));
        assert_eq!(limiter.remaining("alice"), 0);
        // other users are unaffected
        assert!(limiter.try_admit("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        for (max, window_secs) in [(1usize, 5u64), (3, 60), (10, 60), (20, 300)] {
            let limiter = RateLimiter::new(max, Duration::from_secs(window_secs), 100);
            for _ in 0..max {
                assert!(limiter.try_admit("u"));
            }
            assert!(!limiter.try_admit("u"));

            tokio::time::advance(Duration::from_secs(window_secs)).await;
            assert!(limiter.try_admit("u"), "max {max} window {window_secs}s");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_extend_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10), 100);
        assert!(limiter.try_admit("u"));
        assert!(limiter.try_admit("u"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!limiter.try_admit("u"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.try_admit("u"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_users_pruned() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10), 2);
        assert!(limiter.try_admit("a"));
        assert!(limiter.try_admit("b"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.try_admit("c"));
        assert_eq!(limiter.tracked_users(), 1);
    }

    #[tokio::test]
    async fn test_gate_caps_concurrency() {
        let gate = ConcurrencyGate::new(3);
        let p1 = gate.acquire().await.unwrap();
        let _p2 = gate.acquire().await.unwrap();
        let _p3 = gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(blocked.is_err());

        drop(p1);
        assert_eq!(gate.available(), 1);
        assert!(gate.acquire().await.is_ok());
    }
}
