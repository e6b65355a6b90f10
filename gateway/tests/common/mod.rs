//! Shared test fixtures: an in-memory store implementing the persistence
//! contract, config pointed at mock servers, and an app bootstrapper.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use gemlink::config::Config;
use gemlink::models::account::GeminiAccount;
use gemlink::models::request_log::RequestLog;
use gemlink::store::{reactivation_cutoff, AccountPatch, AccountStore};
use gemlink::AppState;

pub const TEST_API_KEY: &str = "sk-test-0123456789abcdef";

pub struct MemStore {
    pub accounts: Mutex<Vec<GeminiAccount>>,
    pub logs: Mutex<Vec<RequestLog>>,
    pub api_keys: Mutex<Vec<String>>,
}

impl MemStore {
    pub fn new(accounts: Vec<GeminiAccount>) -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(accounts),
            logs: Mutex::new(Vec::new()),
            api_keys: Mutex::new(vec![TEST_API_KEY.to_string()]),
        })
    }

    pub async fn account(&self, email: &str) -> GeminiAccount {
        self.accounts
            .lock()
            .await
            .iter()
            .find(|a| a.email == email)
            .cloned()
            .expect("account not found")
    }
}

#[async_trait]
impl AccountStore for MemStore {
    async fn get_active_accounts(&self) -> anyhow::Result<Vec<GeminiAccount>> {
        let mut accounts: Vec<GeminiAccount> = self
            .accounts
            .lock()
            .await
            .iter()
            .filter(|a| a.active)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.last_used_at);
        Ok(accounts)
    }

    async fn list_accounts(&self) -> anyhow::Result<Vec<GeminiAccount>> {
        Ok(self.accounts.lock().await.clone())
    }

    async fn update_account(&self, email: &str, patch: AccountPatch) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock().await;
        if let Some(a) = accounts.iter_mut().find(|a| a.email == email) {
            if let Some(t) = patch.access_token {
                a.access_token = t;
            }
            if let Some(t) = patch.refresh_token {
                a.refresh_token = t;
            }
            if let Some(e) = patch.expires_at {
                a.expires_at = e;
            }
            if let Some(l) = patch.last_used_at {
                a.last_used_at = l;
            }
        }
        Ok(())
    }

    async fn increment_account_stats(
        &self,
        email: &str,
        successful: i64,
        failed: i64,
        tokens: i64,
    ) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock().await;
        if let Some(a) = accounts.iter_mut().find(|a| a.email == email) {
            a.total_requests += successful + failed;
            a.successful_requests += successful;
            a.failed_requests += failed;
            a.total_tokens += tokens;
        }
        Ok(())
    }

    async fn mark_exhausted(&self, email: &str) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock().await;
        if let Some(a) = accounts.iter_mut().find(|a| a.email == email) {
            a.active = false;
            a.exhausted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn reactivate_exhausted_accounts(&self, cooldown: Duration) -> anyhow::Result<u64> {
        let cutoff = reactivation_cutoff(Utc::now(), cooldown);
        let mut count = 0;
        let mut accounts = self.accounts.lock().await;
        for a in accounts.iter_mut() {
            if let Some(at) = a.exhausted_at {
                if at < cutoff {
                    a.active = true;
                    a.exhausted_at = None;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn add_request_log(&self, entry: &RequestLog) -> anyhow::Result<()> {
        self.logs.lock().await.push(entry.clone());
        Ok(())
    }

    async fn validate_api_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.api_keys.lock().await.iter().any(|k| k == key))
    }
}

/// An enrolled account with a far-future token. `lru_rank` orders
/// `last_used_at` so rank 0 is tried first.
pub fn account(email: &str, lru_rank: i64) -> GeminiAccount {
    GeminiAccount {
        email: email.into(),
        access_token: format!("token-{}", email),
        refresh_token: format!("refresh-{}", email),
        expires_at: Utc::now() + chrono::Duration::hours(2),
        project_id: format!("project-{}", email),
        active: true,
        last_used_at: Utc::now() - chrono::Duration::hours(10) + chrono::Duration::minutes(lru_rank),
        exhausted_at: None,
        total_requests: 0,
        successful_requests: 0,
        failed_requests: 0,
        total_tokens: 0,
        tier_paid: false,
    }
}

/// Config with tight timings so rotation tests finish quickly.
pub fn test_config(code_assist_endpoint: &str, oauth_token_url: &str) -> Config {
    Config {
        port: 0,
        database_url: String::new(),
        max_attempts: 2,
        inter_account_stagger: Duration::from_millis(1),
        base_retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(40),
        jitter_factor: 0.1,
        rate_limit_max: 60,
        rate_limit_window: Duration::from_secs(60),
        concurrency_cap: 3,
        account_cache_ttl: Duration::from_secs(5),
        token_refresh_margin: Duration::from_secs(300),
        exhaustion_cooldown: Duration::from_secs(3600),
        probe_margin: Duration::from_secs(120),
        min_probe_interval: Duration::from_secs(30),
        default_model: "gemini-2.5-flash".into(),
        fallback_model: "gemini-2.5-pro".into(),
        fallback_model_v2: "gemini-3.1-pro".into(),
        code_assist_endpoint: code_assist_endpoint.trim_end_matches('/').to_string(),
        oauth_token_url: oauth_token_url.to_string(),
        oauth_client_id: "test-client".into(),
        oauth_client_secret: "test-secret".into(),
        unary_timeout: Duration::from_secs(5),
        stream_read_timeout: Duration::from_secs(5),
        reactivate_interval: Duration::from_secs(300),
    }
}

pub struct TestApp {
    pub base_url: String,
    pub state: Arc<AppState>,
    pub store: Arc<MemStore>,
    pub client: reqwest::Client,
}

/// Bind the real router on an ephemeral port.
pub async fn spawn_app(config: Config, store: Arc<MemStore>) -> TestApp {
    let state = AppState::new(config, store.clone());
    let app = gemlink::api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{}", addr),
        state,
        store,
        client: reqwest::Client::new(),
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Let spawned bookkeeping tasks (stats, logs) settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
