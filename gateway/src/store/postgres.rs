use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::models::account::GeminiAccount;
use crate::models::request_log::RequestLog;
use crate::store::{reactivation_cutoff, AccountPatch, AccountStore};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get_active_accounts(&self) -> anyhow::Result<Vec<GeminiAccount>> {
        let rows = sqlx::query_as::<_, GeminiAccount>(
            r#"SELECT email, access_token, refresh_token, expires_at, project_id, active,
                      last_used_at, exhausted_at, total_requests, successful_requests,
                      failed_requests, total_tokens, tier_paid
               FROM accounts WHERE active = TRUE ORDER BY last_used_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_accounts(&self) -> anyhow::Result<Vec<GeminiAccount>> {
        let rows = sqlx::query_as::<_, GeminiAccount>(
            r#"SELECT email, access_token, refresh_token, expires_at, project_id, active,
                      last_used_at, exhausted_at, total_requests, successful_requests,
                      failed_requests, total_tokens, tier_paid
               FROM accounts ORDER BY email ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_account(&self, email: &str, patch: AccountPatch) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE accounts SET
                   access_token  = COALESCE($2, access_token),
                   refresh_token = COALESCE($3, refresh_token),
                   expires_at    = COALESCE($4, expires_at),
                   last_used_at  = COALESCE($5, last_used_at)
               WHERE email = $1"#,
        )
        .bind(email)
        .bind(patch.access_token)
        .bind(patch.refresh_token)
        .bind(patch.expires_at)
        .bind(patch.last_used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_account_stats(
        &self,
        email: &str,
        successful: i64,
        failed: i64,
        tokens: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE accounts SET
                   total_requests      = total_requests + $2 + $3,
                   successful_requests = successful_requests + $2,
                   failed_requests     = failed_requests + $3,
                   total_tokens        = total_tokens + $4
               WHERE email = $1"#,
        )
        .bind(email)
        .bind(successful)
        .bind(failed)
        .bind(tokens)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_exhausted(&self, email: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE accounts SET active = FALSE, exhausted_at = NOW() WHERE email = $1")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reactivate_exhausted_accounts(
        &self,
        cooldown: std::time::Duration,
    ) -> anyhow::Result<u64> {
        let cutoff = reactivation_cutoff(Utc::now(), cooldown);
        let result = sqlx::query(
            r#"UPDATE accounts SET active = TRUE, exhausted_at = NULL
               WHERE exhausted_at IS NOT NULL AND exhausted_at < $1"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn add_request_log(&self, entry: &RequestLog) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO request_logs
                   (id, account_email, model, prompt, response_text, tokens, success,
                    system_instruction, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(entry.id)
        .bind(&entry.account_email)
        .bind(&entry.model)
        .bind(&entry.prompt)
        .bind(&entry.response_text)
        .bind(entry.tokens)
        .bind(entry.success)
        .bind(&entry.system_instruction)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn validate_api_key(&self, key: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE api_keys SET request_count = request_count + 1, last_used_at = NOW()
               WHERE key_hash = $1"#,
        )
        .bind(hash_api_key(key))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// SHA-256 hex digest of a client credential. Only the digest (plus a short
/// visible prefix) is ever stored.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}
