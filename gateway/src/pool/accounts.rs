//! Account pool state: the active-account cache and the single-flight
//! token-refresh path.
//!
//! Readers get an `Arc` snapshot of the list; a snapshot never reflects
//! concurrent writes, which is fine because staleness is bounded by the
//! cache TTL. The refresh path guarantees at most one live token exchange
//! per account regardless of request concurrency.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};

use crate::models::account::GeminiAccount;
use crate::oauth::OAuthClient;
use crate::store::{AccountPatch, SharedStore};

// ── Single-flight ───────────────────────────────────────────────

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, String>>>;

/// Deduplicates concurrent operations by key: callers arriving while an
/// operation is in flight await the same future and share its result.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: Mutex<HashMap<String, FlightFuture<T>>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        let fut = {
            let mut map = self.inflight.lock().await;
            match map.get(key) {
                // Join the live flight. A finished future left behind by a
                // cancelled waiter is stale — start fresh instead.
                Some(existing) if existing.peek().is_none() => existing.clone(),
                _ => {
                    let fut = make().boxed().shared();
                    map.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };

        let result = fut.await;

        let mut map = self.inflight.lock().await;
        if let Some(f) = map.get(key) {
            if f.peek().is_some() {
                map.remove(key);
            }
        }

        result
    }
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Account manager ─────────────────────────────────────────────

struct CacheState {
    accounts: Arc<Vec<GeminiAccount>>,
    fetched_at: Instant,
}

pub struct AccountManager {
    store: SharedStore,
    oauth: OAuthClient,
    cache_ttl: Duration,
    refresh_margin: Duration,
    cache: Arc<RwLock<Option<CacheState>>>,
    refreshing: Arc<AtomicBool>,
    refresh_flight: SingleFlight<String>,
}

impl AccountManager {
    pub fn new(
        store: SharedStore,
        oauth: OAuthClient,
        cache_ttl: Duration,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            store,
            oauth,
            cache_ttl,
            refresh_margin,
            cache: Arc::new(RwLock::new(None)),
            refreshing: Arc::new(AtomicBool::new(false)),
            refresh_flight: SingleFlight::new(),
        }
    }

    /// Current pool snapshot in LRU order. The first call loads from the
    /// store; later calls return the cached list, kicking off a background
    /// reload once the TTL has lapsed.
    pub async fn get_ready_accounts(&self) -> anyhow::Result<Arc<Vec<GeminiAccount>>> {
        {
            let guard = self.cache.read().await;
            if let Some(state) = guard.as_ref() {
                let accounts = state.accounts.clone();
                if state.fetched_at.elapsed() >= self.cache_ttl {
                    self.spawn_background_reload();
                }
                return Ok(accounts);
            }
        }
        self.reload().await
    }

    /// Eager load at startup so the first request doesn't pay for it.
    pub async fn warm(&self) -> anyhow::Result<()> {
        let accounts = self.reload().await?;
        tracing::info!(count = accounts.len(), "account pool warmed");
        Ok(())
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Number of accounts in the current snapshot (health endpoint).
    pub async fn cached_count(&self) -> usize {
        self.cache
            .read()
            .await
            .as_ref()
            .map(|s| s.accounts.len())
            .unwrap_or(0)
    }

    async fn reload(&self) -> anyhow::Result<Arc<Vec<GeminiAccount>>> {
        let accounts = Arc::new(self.store.get_active_accounts().await?);
        *self.cache.write().await = Some(CacheState {
            accounts: accounts.clone(),
            fetched_at: Instant::now(),
        });
        Ok(accounts)
    }

    fn spawn_background_reload(&self) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let store = self.store.clone();
        let cache = self.cache.clone();
        let flag = self.refreshing.clone();
        tokio::spawn(async move {
            match store.get_active_accounts().await {
                Ok(accounts) => {
                    *cache.write().await = Some(CacheState {
                        accounts: Arc::new(accounts),
                        fetched_at: Instant::now(),
                    });
                }
                // Keep serving the previous list.
                Err(e) => tracing::warn!("account cache reload failed: {}", e),
            }
            flag.store(false, Ordering::SeqCst);
        });
    }

    /// Return a usable access token for the account, refreshing it first if
    /// it expires within the margin. Concurrent callers for the same account
    /// share one token exchange.
    pub async fn ensure_fresh_token(&self, account: &GeminiAccount) -> anyhow::Result<String> {
        if account.token_is_fresh(self.refresh_margin) {
            return Ok(account.access_token.clone());
        }

        let store = self.store.clone();
        let oauth = self.oauth.clone();
        let cache = self.cache.clone();
        let account = account.clone();
        let email = account.email.clone();

        self.refresh_flight
            .run(&email, move || async move {
                refresh_and_persist(store, oauth, cache, account)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}

/// The refresh itself. The store write must land before the token is handed
/// to any caller; single-flight makes this ordering hold for every waiter.
async fn refresh_and_persist(
    store: SharedStore,
    oauth: OAuthClient,
    cache: Arc<RwLock<Option<CacheState>>>,
    account: GeminiAccount,
) -> anyhow::Result<String> {
    let refreshed = oauth.refresh(&account.refresh_token).await?;
    // Providers may omit the refresh token when it is unchanged.
    let refresh_token = refreshed
        .refresh_token
        .clone()
        .unwrap_or_else(|| account.refresh_token.clone());

    store
        .update_account(
            &account.email,
            AccountPatch {
                access_token: Some(refreshed.access_token.clone()),
                refresh_token: Some(refresh_token.clone()),
                expires_at: Some(refreshed.expires_at),
                ..Default::default()
            },
        )
        .await?;

    // Patch the snapshot so other in-flight requests pick up the new token
    // without waiting out the TTL.
    let mut guard = cache.write().await;
    if let Some(state) = guard.as_mut() {
        let mut accounts = state.accounts.as_ref().clone();
        if let Some(a) = accounts.iter_mut().find(|a| a.email == account.email) {
            a.access_token = refreshed.access_token.clone();
            a.refresh_token = refresh_token;
            a.expires_at = refreshed.expires_at;
        }
        state.accounts = Arc::new(accounts);
    }
    drop(guard);

    tracing::info!(account = %account.email, "access token refreshed");
    Ok(refreshed.access_token)
}
