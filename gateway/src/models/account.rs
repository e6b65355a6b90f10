use chrono::{DateTime, Utc};
use serde::Serialize;

/// An enrolled Code-Assist account. One row per email; tokens are held in
/// clear in memory and must never be logged or serialized outward.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GeminiAccount {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub project_id: String,
    pub active: bool,
    pub last_used_at: DateTime<Utc>,
    pub exhausted_at: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub total_tokens: i64,
    pub tier_paid: bool,
}

impl GeminiAccount {
    /// A token counts as fresh while it has at least `margin` of life left.
    pub fn token_is_fresh(&self, margin: std::time::Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        Utc::now() + margin < self.expires_at
    }
}

/// Token-free projection for the CLI and the health endpoint.
#[derive(Debug, Serialize)]
pub struct AccountSummary {
    pub email: String,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub exhausted_at: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub total_tokens: i64,
    pub tier_paid: bool,
}

impl From<&GeminiAccount> for AccountSummary {
    fn from(a: &GeminiAccount) -> Self {
        Self {
            email: a.email.clone(),
            active: a.active,
            expires_at: a.expires_at,
            exhausted_at: a.exhausted_at,
            total_requests: a.total_requests,
            successful_requests: a.successful_requests,
            failed_requests: a.failed_requests,
            total_tokens: a.total_tokens,
            tier_paid: a.tier_paid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn account(expires_in_secs: i64) -> GeminiAccount {
        GeminiAccount {
            email: "a@x.com".into(),
            access_token: "ya29.token".into(),
            refresh_token: "1//refresh".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
            project_id: "proj".into(),
            active: true,
            last_used_at: Utc::now(),
            exhausted_at: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_tokens: 0,
            tier_paid: false,
        }
    }

    #[test]
    fn test_freshness_margin() {
        let margin = Duration::from_secs(300);
        assert!(account(600).token_is_fresh(margin));
        assert!(!account(200).token_is_fresh(margin));
        assert!(!account(-1).token_is_fresh(margin));
    }

    #[test]
    fn test_summary_carries_no_tokens() {
        let a = account(600);
        let json = serde_json::to_string(&AccountSummary::from(&a)).unwrap();
        assert!(!json.contains("ya29"));
        assert!(!json.contains("refresh"));
    }
}
