//! GemLink — Gemini v1beta gateway over a rotating pool of Code-Assist
//! accounts.
//!
//! The binary in `main.rs` wires this together; everything lives here so
//! the integration tests in `tests/` can assemble the same application.

use std::sync::Arc;

pub mod api;
pub mod classify;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod oauth;
pub mod pool;
pub mod proxy;
pub mod store;

use config::Config;
use oauth::OAuthClient;
use pool::accounts::AccountManager;
use pool::cooldown::CooldownTracker;
use proxy::engine::FulfillmentEngine;
use store::SharedStore;

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub accounts: Arc<AccountManager>,
    pub cooldown: Arc<CooldownTracker>,
    pub engine: FulfillmentEngine,
}

impl AppState {
    pub fn new(config: Config, store: SharedStore) -> Arc<Self> {
        let oauth = OAuthClient::new(
            &config.oauth_token_url,
            &config.oauth_client_id,
            &config.oauth_client_secret,
        );
        let accounts = Arc::new(AccountManager::new(
            store.clone(),
            oauth,
            config.account_cache_ttl,
            config.token_refresh_margin,
        ));
        let cooldown = Arc::new(CooldownTracker::new(
            config.probe_margin,
            config.min_probe_interval,
        ));
        let engine = FulfillmentEngine::new(
            config.clone(),
            store.clone(),
            accounts.clone(),
            cooldown.clone(),
        );

        Arc::new(Self {
            config,
            store,
            accounts,
            cooldown,
            engine,
        })
    }
}
