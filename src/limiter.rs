//! Request admission bounded by a sliding time window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Allows at most `limit` request starts inside any window of length `window`.
///
/// Every start time inside the current window is remembered, so the bound holds for every
/// sliding window rather than only for aligned buckets. Waiters are served in FIFO order.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter; `limit` is raised to at least one.
    pub fn new(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            issued: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Requests permitted per window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Waits until a request may start and records it.
    pub async fn acquire(&self) {
        let mut issued = self.issued.lock().await;
        loop {
            let now = Instant::now();
            while issued
                .front()
                .is_some_and(|&start| now.duration_since(start) >= self.window)
            {
                issued.pop_front();
            }
            match issued.front() {
                Some(&oldest) if issued.len() >= self.limit => {
                    sleep_until(oldest + self.window).await;
                }
                _ => {
                    issued.push_back(now);
                    return;
                }
            }
        }
    }
}
