//! Persistence contract consumed by the fulfillment engine.
//!
//! `PgStore` is the production implementation; tests substitute an
//! in-memory double. Every method is atomic at the single-row level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::account::GeminiAccount;
use crate::models::request_log::RequestLog;

pub mod postgres;

/// Partial update of an account row; only `Some` fields are written.
#[derive(Debug, Default, Clone)]
pub struct AccountPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    /// Active accounts sorted ascending by `last_used_at` (LRU first).
    async fn get_active_accounts(&self) -> anyhow::Result<Vec<GeminiAccount>>;

    /// All accounts, for operator listings.
    async fn list_accounts(&self) -> anyhow::Result<Vec<GeminiAccount>>;

    async fn update_account(&self, email: &str, patch: AccountPatch) -> anyhow::Result<()>;

    /// Atomic counter add; `successful`/`failed` are 0 or 1 per request.
    async fn increment_account_stats(
        &self,
        email: &str,
        successful: i64,
        failed: i64,
        tokens: i64,
    ) -> anyhow::Result<()>;

    /// Durable exhaustion: `active = false`, `exhausted_at = now`.
    async fn mark_exhausted(&self, email: &str) -> anyhow::Result<()>;

    /// Reactivate accounts whose exhaustion is older than `cooldown`.
    /// Returns how many rows were flipped.
    async fn reactivate_exhausted_accounts(&self, cooldown: Duration) -> anyhow::Result<u64>;

    /// Best-effort audit record.
    async fn add_request_log(&self, entry: &RequestLog) -> anyhow::Result<()>;

    /// Digest lookup of a client credential.
    async fn validate_api_key(&self, key: &str) -> anyhow::Result<bool>;
}

pub type SharedStore = Arc<dyn AccountStore>;

/// Fire-and-forget log write: persistence hiccups never fail a request.
pub fn log_request_async(store: SharedStore, entry: RequestLog) {
    tokio::spawn(async move {
        if let Err(e) = store.add_request_log(&entry).await {
            tracing::error!(account = %entry.account_email, "failed to write request log: {}", e);
        }
    });
}

/// Same fire-and-forget treatment for counters.
pub fn bump_stats_async(store: SharedStore, email: String, successful: i64, failed: i64, tokens: i64) {
    tokio::spawn(async move {
        if let Err(e) = store
            .increment_account_stats(&email, successful, failed, tokens)
            .await
        {
            tracing::error!(account = %email, "failed to update account stats: {}", e);
        }
    });
}

/// The cutoff instant for durable reactivation: anything exhausted before
/// this is eligible.
pub fn reactivation_cutoff(now: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::minutes(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactivation_cutoff_selects_old_exhaustion() {
        let now = Utc::now();
        let cutoff = reactivation_cutoff(now, Duration::from_secs(3600));

        // Exhausted 90 minutes ago: before the cutoff → reactivated.
        let old = now - chrono::Duration::minutes(90);
        assert!(old < cutoff);

        // Exhausted 10 minutes ago: after the cutoff → left alone.
        let recent = now - chrono::Duration::minutes(10);
        assert!(recent > cutoff);
    }
}
