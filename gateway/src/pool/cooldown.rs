//! In-memory cooldown registry for pool accounts.
//!
//! Tracks per-account failure state with escalating cooldown windows and
//! probe scheduling for early-recovery detection. This map is the system of
//! record while the process runs; durable exhaustion in Postgres only exists
//! so a restart doesn't forget quota-dead accounts.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::classify::ErrorCategory;

const ESCALATION_BASE: Duration = Duration::from_secs(15);
const ESCALATION_CAP: Duration = Duration::from_secs(120);
const QUOTA_COOLDOWN: Duration = Duration::from_secs(60 * 60);
const TIMEOUT_COOLDOWN: Duration = Duration::from_secs(5);
// Manual recovery only; one year stands in for "never".
const MANUAL_RECOVERY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CooldownState {
    until: Instant,
    category: ErrorCategory,
    failure_count: u32,
    last_probe_at: Option<Instant>,
}

pub struct CooldownTracker {
    entries: DashMap<String, CooldownState>,
    probe_margin: Duration,
    min_probe_interval: Duration,
}

impl CooldownTracker {
    pub fn new(probe_margin: Duration, min_probe_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            probe_margin,
            min_probe_interval,
        }
    }

    /// Record a failure. Returns the cooldown duration applied.
    pub fn mark_cooldown(&self, email: &str, category: ErrorCategory) -> Duration {
        let failure_count = self
            .entries
            .get(email)
            .map(|s| s.failure_count)
            .unwrap_or(0)
            + 1;

        let duration = cooldown_duration(category, failure_count);
        self.entries.insert(
            email.to_string(),
            CooldownState {
                until: Instant::now() + duration,
                category,
                failure_count,
                last_probe_at: None,
            },
        );

        tracing::warn!(
            account = email,
            category = %category,
            failures = failure_count,
            cooldown_secs = duration.as_secs(),
            "account placed in cooldown"
        );
        duration
    }

    /// True while the account is cooling down. Expired entries are removed
    /// on read so a passed cooldown needs no sweep to clear.
    pub fn in_cooldown(&self, email: &str) -> bool {
        let expired = match self.entries.get(email) {
            Some(state) => {
                if Instant::now() < state.until {
                    return true;
                }
                true // present but expired
            }
            None => false,
        };
        if expired {
            self.entries.remove(email);
        }
        false
    }

    /// Whether a cooled-down account deserves a probe attempt: recoverable
    /// category, probe interval elapsed, and either a throttle category
    /// (probed eagerly) or the cooldown is within the probe margin of ending.
    pub fn should_probe(&self, email: &str) -> bool {
        let Some(state) = self.entries.get(email) else {
            return false;
        };

        if matches!(state.category, ErrorCategory::Auth | ErrorCategory::Billing) {
            return false;
        }

        let now = Instant::now();
        if let Some(last) = state.last_probe_at {
            if now.duration_since(last) < self.min_probe_interval {
                return false;
            }
        }

        match state.category {
            ErrorCategory::RateLimit | ErrorCategory::Overloaded => true,
            _ => now + self.probe_margin >= state.until,
        }
    }

    pub fn record_probe(&self, email: &str) {
        if let Some(mut state) = self.entries.get_mut(email) {
            state.last_probe_at = Some(Instant::now());
            tracing::debug!(account = email, "probing cooled-down account");
        }
    }

    /// The sole healing transition: success wipes the entry, including its
    /// failure count.
    pub fn mark_success(&self, email: &str) {
        if self.entries.remove(email).is_some() {
            tracing::info!(account = email, "account recovered, cooldown cleared");
        }
    }

    /// Sweep expired entries; returns how many were removed.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, state| state.until > now);
        before - self.entries.len()
    }

    /// Number of accounts currently cooling down (for the health endpoint).
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.until > now).count()
    }
}

fn cooldown_duration(category: ErrorCategory, failure_count: u32) -> Duration {
    match category {
        ErrorCategory::RateLimit | ErrorCategory::Overloaded => {
            let exp = failure_count.saturating_sub(1).min(16);
            let escalated = ESCALATION_BASE * 2u32.saturating_pow(exp);
            escalated.min(ESCALATION_CAP)
        }
        ErrorCategory::Quota => QUOTA_COOLDOWN,
        ErrorCategory::Auth | ErrorCategory::Billing => MANUAL_RECOVERY,
        ErrorCategory::Timeout => TIMEOUT_COOLDOWN,
        _ => ESCALATION_BASE,
    }
}
