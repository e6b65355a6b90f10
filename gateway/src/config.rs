use std::time::Duration;

/// Runtime configuration, sourced from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,

    // Rotation loop
    pub max_attempts: u32,
    pub inter_account_stagger: Duration,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub jitter_factor: f64,

    // Per-account budget
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,

    // Process-wide outbound cap
    pub concurrency_cap: usize,

    // Account cache / token lifecycle
    pub account_cache_ttl: Duration,
    pub token_refresh_margin: Duration,
    pub exhaustion_cooldown: Duration,
    pub probe_margin: Duration,
    pub min_probe_interval: Duration,

    // Model chain
    pub default_model: String,
    pub fallback_model: String,
    pub fallback_model_v2: String,

    // Upstream endpoints
    pub code_assist_endpoint: String,
    pub oauth_token_url: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,

    // Timeouts
    pub unary_timeout: Duration,
    pub stream_read_timeout: Duration,

    // Background jobs
    pub reactivate_interval: Duration,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    Ok(Config {
        port: env_parse("GEMLINK_PORT", 8787),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/gemlink".into()),

        max_attempts: env_parse("GEMLINK_MAX_ATTEMPTS", 5),
        inter_account_stagger: Duration::from_millis(env_parse("GEMLINK_STAGGER_MS", 150)),
        base_retry_delay: Duration::from_millis(env_parse("GEMLINK_BASE_RETRY_DELAY_MS", 2_000)),
        max_retry_delay: Duration::from_millis(env_parse("GEMLINK_MAX_RETRY_DELAY_MS", 60_000)),
        jitter_factor: env_parse("GEMLINK_JITTER_FACTOR", 0.2),

        rate_limit_max: env_parse("GEMLINK_RATE_LIMIT_MAX", 60),
        rate_limit_window: Duration::from_secs(env_parse("GEMLINK_RATE_LIMIT_WINDOW_SECS", 60)),

        concurrency_cap: env_parse("GEMLINK_CONCURRENCY_CAP", 3),

        account_cache_ttl: Duration::from_secs(env_parse("GEMLINK_ACCOUNT_CACHE_TTL_SECS", 5)),
        token_refresh_margin: Duration::from_secs(env_parse(
            "GEMLINK_TOKEN_REFRESH_MARGIN_SECS",
            300,
        )),
        exhaustion_cooldown: Duration::from_secs(
            env_parse("GEMLINK_EXHAUSTION_COOLDOWN_MINS", 60u64) * 60,
        ),
        probe_margin: Duration::from_secs(env_parse("GEMLINK_PROBE_MARGIN_SECS", 120)),
        min_probe_interval: Duration::from_secs(env_parse("GEMLINK_MIN_PROBE_INTERVAL_SECS", 30)),

        default_model: env_string("GEMLINK_DEFAULT_MODEL", "gemini-2.5-flash"),
        fallback_model: env_string("GEMLINK_FALLBACK_MODEL", "gemini-2.5-pro"),
        fallback_model_v2: env_string("GEMLINK_FALLBACK_MODEL_V2", "gemini-3.1-pro"),

        code_assist_endpoint: env_string(
            "GEMLINK_CODE_ASSIST_ENDPOINT",
            "https://cloudcode-pa.googleapis.com",
        ),
        oauth_token_url: env_string(
            "GEMLINK_OAUTH_TOKEN_URL",
            "https://oauth2.googleapis.com/token",
        ),
        oauth_client_id: env_string(
            "GEMLINK_OAUTH_CLIENT_ID",
            "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com",
        ),
        oauth_client_secret: env_string(
            "GEMLINK_OAUTH_CLIENT_SECRET",
            "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",
        ),

        unary_timeout: Duration::from_secs(env_parse("GEMLINK_UNARY_TIMEOUT_SECS", 30)),
        stream_read_timeout: Duration::from_secs(env_parse("GEMLINK_STREAM_TIMEOUT_SECS", 120)),

        reactivate_interval: Duration::from_secs(env_parse(
            "GEMLINK_REACTIVATE_INTERVAL_SECS",
            300,
        )),
    })
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let cfg = load().unwrap();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.inter_account_stagger, Duration::from_millis(150));
        assert_eq!(cfg.rate_limit_max, 60);
        assert_eq!(cfg.concurrency_cap, 3);
        assert_eq!(cfg.account_cache_ttl, Duration::from_secs(5));
        assert_eq!(cfg.exhaustion_cooldown, Duration::from_secs(3600));
        assert_eq!(cfg.default_model, "gemini-2.5-flash");
    }
}
