//! Inter-round retry delay: exponential backoff with jitter, overridden by
//! an upstream `Retry-After` hint when one was seen during the round.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max,
            jitter_factor,
        }
    }

    /// Delay before the next rotation round. `retry_after` is the raw header
    /// value, if any upstream response in the round carried one; it replaces
    /// the exponential term but is still jittered and capped.
    pub fn compute(&self, attempt: u32, retry_after: Option<&str>) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let raw_ms = match retry_after.and_then(parse_retry_after) {
            // Server hint, floored at the base delay.
            Some(hint) => (hint.as_millis() as f64).max(base_ms),
            None => base_ms * 2f64.powi(attempt.min(16) as i32),
        };

        let capped = raw_ms.min(self.max.as_millis() as f64);
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        Duration::from_millis((capped * jitter) as u64)
    }
}

/// `Retry-After` is either delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let delta = date.with_timezone(&Utc) - Utc::now();
        return Some(delta.to_std().unwrap_or(Duration::ZERO));
    }
    None
}
