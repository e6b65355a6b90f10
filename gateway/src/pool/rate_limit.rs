//! Client-side request budget, fixed window per account.
//!
//! This throttles our own calls toward the upstream so a single hot account
//! doesn't burn through its per-minute allowance; it is unrelated to any
//! limit the upstream enforces on us.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Duration,
    pub remaining: u32,
}

#[derive(Debug)]
struct Window {
    count: u32,
    started_at: Instant,
}

pub struct RateLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Take one unit of budget for the account, resetting the window first
    /// if it has lapsed.
    pub fn consume(&self, email: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(email.to_string()).or_insert(Window {
            count: 0,
            started_at: now,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.count = 0;
            entry.started_at = now;
        }

        if entry.count >= self.max_requests {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(entry.started_at));
            return RateDecision {
                allowed: false,
                retry_after,
                remaining: 0,
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining: self.max_requests - entry.count,
        }
    }

    /// Drop the window for one account. Idempotent.
    pub fn reset(&self, email: &str) {
        self.windows.remove(email);
    }

    pub fn reset_all(&self) {
        self.windows.clear();
    }
}
