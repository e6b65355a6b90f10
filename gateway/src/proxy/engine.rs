//! The request-fulfillment engine.
//!
//! One rotation skeleton serves both entry points: walk the account pool in
//! LRU order, skip accounts that are cooling down or out of budget, refresh
//! the token, make the gated upstream call, classify failures into cooldowns
//! and move on. Rounds are separated by jittered backoff until either an
//! account succeeds or the attempt budget runs out.
//!
//! Attempts are strictly sequential — racing several accounts would multiply
//! upstream load and defeat the per-IP concurrency cap.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::classify::{classify, classify_response, ErrorCategory};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::account::GeminiAccount;
use crate::models::request_log::RequestLog;
use crate::pool::accounts::AccountManager;
use crate::pool::backoff::BackoffPolicy;
use crate::pool::cooldown::CooldownTracker;
use crate::pool::gate::UpstreamGate;
use crate::pool::rate_limit::RateLimiter;
use crate::proxy::payload::{
    build_upstream_body, has_content, next_fallback_model, prompt_text, resolve_model,
    response_text, system_instruction_text, total_token_count, unwrap_envelope,
};
use crate::proxy::sse::{done_frame, format_frame, FrameMode, SsePipe};
use crate::proxy::upstream::{code_assist_headers, StreamingExchange, UpstreamClient};
use crate::store::{bump_stats_async, log_request_async, AccountPatch, SharedStore};

enum UnaryOutcome {
    Success(Value),
    Skip,
}

enum StreamOutcome {
    Committed(Body),
    Skip,
}

pub struct FulfillmentEngine {
    config: Config,
    store: SharedStore,
    accounts: Arc<AccountManager>,
    cooldown: Arc<CooldownTracker>,
    rate_limiter: Arc<RateLimiter>,
    gate: UpstreamGate,
    upstream: UpstreamClient,
    backoff: BackoffPolicy,
}

impl FulfillmentEngine {
    pub fn new(
        config: Config,
        store: SharedStore,
        accounts: Arc<AccountManager>,
        cooldown: Arc<CooldownTracker>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_max,
            config.rate_limit_window,
        ));
        let gate = UpstreamGate::new(config.concurrency_cap);
        let upstream = UpstreamClient::new(config.unary_timeout, config.stream_read_timeout);
        let backoff = BackoffPolicy::new(
            config.base_retry_delay,
            config.max_retry_delay,
            config.jitter_factor,
        );
        Self {
            config,
            store,
            accounts,
            cooldown,
            rate_limiter,
            gate,
            upstream,
            backoff,
        }
    }

    fn unary_url(&self) -> String {
        format!("{}/v1internal:generateContent", self.config.code_assist_endpoint)
    }

    fn streaming_url(&self) -> String {
        format!(
            "{}/v1internal:streamGenerateContent?alt=sse",
            self.config.code_assist_endpoint
        )
    }

    // ── Unary ───────────────────────────────────────────────────

    pub async fn generate(
        &self,
        requested_model: Option<&str>,
        inbound: &Value,
    ) -> Result<Value, AppError> {
        let model = resolve_model(requested_model, &self.config);
        let mut retry_after: Option<String> = None;

        for attempt in 0..self.config.max_attempts {
            let accounts = self
                .accounts
                .get_ready_accounts()
                .await
                .map_err(AppError::Internal)?;
            if accounts.is_empty() {
                return Err(AppError::NoAccounts);
            }

            for (i, account) in accounts.iter().enumerate() {
                if !self.account_is_usable(account) {
                    continue;
                }
                if i > 0 {
                    tokio::time::sleep(self.config.inter_account_stagger).await;
                }

                let token = match self.accounts.ensure_fresh_token(account).await {
                    Ok(t) => t,
                    Err(e) => {
                        self.handle_thrown(account, &e.to_string());
                        continue;
                    }
                };

                match self
                    .try_account_unary(account, &token, &model, inbound, &mut retry_after)
                    .await
                {
                    UnaryOutcome::Success(value) => return Ok(value),
                    UnaryOutcome::Skip => continue,
                }
            }

            tracing::debug!(attempt = attempt, "rotation round exhausted, backing off");
            tokio::time::sleep(self.backoff.compute(attempt, retry_after.as_deref())).await;
        }

        Err(AppError::PoolExhausted)
    }

    async fn try_account_unary(
        &self,
        account: &GeminiAccount,
        token: &str,
        model: &str,
        inbound: &Value,
        retry_after: &mut Option<String>,
    ) -> UnaryOutcome {
        let exchange = match self.call_unary(token, model, &account.project_id, inbound).await {
            Ok(ex) => ex,
            Err(e) => {
                self.handle_thrown(account, &e.to_string());
                return UnaryOutcome::Skip;
            }
        };
        if let Some(ra) = &exchange.retry_after {
            *retry_after = Some(ra.clone());
        }

        if exchange.ok() {
            if let Some(value) = parse_success_body(&exchange.body) {
                self.record_success(account, model, inbound, &value, token);
                return UnaryOutcome::Success(value);
            }
            // 200 with no usable content; the account isn't at fault.
            self.record_failure(account, model, inbound, &exchange.body, token);
            return UnaryOutcome::Skip;
        }

        if exchange.status == 429 {
            // One shot at the next model in the chain before cooling down.
            if let Some(fb_model) = next_fallback_model(model, &self.config) {
                tracing::info!(
                    account = %account.email,
                    from = model,
                    to = %fb_model,
                    "rate limited, trying fallback model"
                );
                if let Ok(fb) = self
                    .call_unary(token, &fb_model, &account.project_id, inbound)
                    .await
                {
                    if fb.ok() {
                        if let Some(value) = parse_success_body(&fb.body) {
                            // Deliberately no cooldown for the primary call.
                            self.record_success(account, &fb_model, inbound, &value, token);
                            return UnaryOutcome::Success(value);
                        }
                    }
                }
            }

            let category = classify_response(429, &exchange.body);
            self.apply_cooldown(account, category);
            self.record_failure(account, model, inbound, &exchange.body, token);
            return UnaryOutcome::Skip;
        }

        // Other non-2xx: count the failure but leave the account in rotation.
        tracing::warn!(
            account = %account.email,
            status = exchange.status,
            "upstream rejected call"
        );
        self.record_failure(account, model, inbound, &exchange.body, token);
        UnaryOutcome::Skip
    }

    async fn call_unary(
        &self,
        token: &str,
        model: &str,
        project: &str,
        inbound: &Value,
    ) -> anyhow::Result<crate::proxy::upstream::UnaryExchange> {
        let headers = code_assist_headers(token)?;
        let body = serde_json::to_vec(&build_upstream_body(model, project, inbound))?;
        let url = self.unary_url();
        self.gate.run(self.upstream.post_unary(&url, headers, body)).await
    }

    // ── Streaming ───────────────────────────────────────────────

    /// Rotate accounts until one yields a committed stream. The returned
    /// body already carries the first frame; from that point on failures
    /// end the response cleanly instead of failing over.
    pub async fn stream_generate(
        &self,
        requested_model: Option<&str>,
        inbound: &Value,
    ) -> Result<Body, AppError> {
        let model = resolve_model(requested_model, &self.config);
        let mut retry_after: Option<String> = None;

        for attempt in 0..self.config.max_attempts {
            let accounts = self
                .accounts
                .get_ready_accounts()
                .await
                .map_err(AppError::Internal)?;
            if accounts.is_empty() {
                return Err(AppError::NoAccounts);
            }

            for (i, account) in accounts.iter().enumerate() {
                if !self.account_is_usable(account) {
                    continue;
                }
                if i > 0 {
                    tokio::time::sleep(self.config.inter_account_stagger).await;
                }

                let token = match self.accounts.ensure_fresh_token(account).await {
                    Ok(t) => t,
                    Err(e) => {
                        self.handle_thrown(account, &e.to_string());
                        continue;
                    }
                };

                match self
                    .try_account_streaming(account, &token, &model, inbound, &mut retry_after)
                    .await
                {
                    StreamOutcome::Committed(body) => return Ok(body),
                    StreamOutcome::Skip => continue,
                }
            }

            tokio::time::sleep(self.backoff.compute(attempt, retry_after.as_deref())).await;
        }

        Err(AppError::PoolExhausted)
    }

    async fn try_account_streaming(
        &self,
        account: &GeminiAccount,
        token: &str,
        model: &str,
        inbound: &Value,
        retry_after: &mut Option<String>,
    ) -> StreamOutcome {
        let exchange = match self
            .call_streaming(token, model, &account.project_id, inbound)
            .await
        {
            Ok(ex) => ex,
            Err(e) => {
                self.handle_thrown(account, &e.to_string());
                return StreamOutcome::Skip;
            }
        };
        if let Some(ra) = &exchange.retry_after {
            *retry_after = Some(ra.clone());
        }

        let (exchange, model_used) = if exchange.status == 429 {
            match self.stream_fallback(account, token, model, inbound).await {
                Some((fb_exchange, fb_model)) => {
                    // Adopt the fallback; drain the original first so its
                    // connection goes back to the pool instead of being reset.
                    let _ = exchange.response.bytes().await;
                    (fb_exchange, fb_model)
                }
                None => {
                    let body = exchange.response.text().await.unwrap_or_default();
                    let category = classify_response(429, &body);
                    self.apply_cooldown(account, category);
                    self.record_failure(account, model, inbound, &body, token);
                    return StreamOutcome::Skip;
                }
            }
        } else {
            (exchange, model.to_string())
        };

        if !(200..300).contains(&exchange.status) {
            let status = exchange.status;
            let body = exchange.response.text().await.unwrap_or_default();
            tracing::warn!(account = %account.email, status = status, "upstream rejected stream");
            self.record_failure(account, &model_used, inbound, &body, token);
            return StreamOutcome::Skip;
        }

        // 2xx received, but downstream headers are not committed until the
        // first frame exists. A stream dying before that falls back normally.
        let mut pipe = SsePipe::new(FrameMode::Unwrap);
        let mut byte_stream: BoxStream<'static, reqwest::Result<Bytes>> =
            exchange.response.bytes_stream().boxed();
        let mut pending: VecDeque<Bytes> = VecDeque::new();

        loop {
            match byte_stream.next().await {
                Some(Ok(bytes)) => {
                    for frame in pipe.push_chunk(&bytes) {
                        pending.push_back(Bytes::from(format_frame(&frame)));
                    }
                    if !pending.is_empty() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    self.handle_thrown(account, &e.to_string());
                    return StreamOutcome::Skip;
                }
                None => {
                    if let Some(tail) = pipe.flush() {
                        pending.push_back(Bytes::from(format_frame(&tail)));
                        break;
                    }
                    self.handle_thrown(account, "stream ended without sending chunks");
                    return StreamOutcome::Skip;
                }
            }
        }

        // Committed: the account delivered. Clear its cooldown now; the rest
        // of the accounting happens when the stream finishes.
        self.cooldown.mark_success(&account.email);
        self.touch_account(account);

        let ctx = StreamAccounting {
            store: self.store.clone(),
            email: account.email.clone(),
            model: model_used,
            prompt: prompt_text(inbound),
            system_instruction: system_instruction_text(inbound),
            secrets: vec![token.to_string(), account.refresh_token.clone()],
        };

        StreamOutcome::Committed(pump_body(byte_stream, pipe, pending, ctx))
    }

    async fn stream_fallback(
        &self,
        account: &GeminiAccount,
        token: &str,
        model: &str,
        inbound: &Value,
    ) -> Option<(StreamingExchange, String)> {
        let fb_model = next_fallback_model(model, &self.config)?;
        tracing::info!(
            account = %account.email,
            from = model,
            to = %fb_model,
            "rate limited, trying fallback model stream"
        );
        match self
            .call_streaming(token, &fb_model, &account.project_id, inbound)
            .await
        {
            Ok(fb) if fb.status == 200 => Some((fb, fb_model)),
            Ok(fb) => {
                // Drain the rejected stream before dropping it.
                let _ = fb.response.bytes().await;
                None
            }
            Err(_) => None,
        }
    }

    async fn call_streaming(
        &self,
        token: &str,
        model: &str,
        project: &str,
        inbound: &Value,
    ) -> anyhow::Result<StreamingExchange> {
        let headers = code_assist_headers(token)?;
        let body = serde_json::to_vec(&build_upstream_body(model, project, inbound))?;
        let url = self.streaming_url();
        // The gate covers connection and response headers; body streaming
        // happens outside the permit so long streams don't starve the pool.
        self.gate
            .run(self.upstream.post_streaming(&url, headers, body))
            .await
    }

    // ── Shared bookkeeping ──────────────────────────────────────

    /// Cooldown and budget gating. Probes pass through a live cooldown.
    fn account_is_usable(&self, account: &GeminiAccount) -> bool {
        if self.cooldown.in_cooldown(&account.email) {
            if self.cooldown.should_probe(&account.email) {
                self.cooldown.record_probe(&account.email);
            } else {
                return false;
            }
        }
        if !self.rate_limiter.consume(&account.email).allowed {
            tracing::debug!(account = %account.email, "client-side rate budget spent");
            return false;
        }
        true
    }

    /// A thrown transport-level error (DNS, reset, refresh failure…):
    /// classify the message and cool the account down under that category.
    fn handle_thrown(&self, account: &GeminiAccount, message: &str) {
        let category = classify(message);
        tracing::warn!(account = %account.email, category = %category, "call failed: {}", message);
        self.apply_cooldown(account, category);
        bump_stats_async(self.store.clone(), account.email.clone(), 0, 1, 0);
    }

    fn apply_cooldown(&self, account: &GeminiAccount, category: ErrorCategory) {
        self.cooldown.mark_cooldown(&account.email, category);
        if category == ErrorCategory::Quota {
            // Durable backup so a restart doesn't forget the exhaustion.
            let store = self.store.clone();
            let email = account.email.clone();
            tokio::spawn(async move {
                if let Err(e) = store.mark_exhausted(&email).await {
                    tracing::error!(account = %email, "failed to persist exhaustion: {}", e);
                }
            });
        }
    }

    fn record_success(
        &self,
        account: &GeminiAccount,
        model: &str,
        inbound: &Value,
        value: &Value,
        token: &str,
    ) {
        self.cooldown.mark_success(&account.email);
        self.touch_account(account);
        let tokens = total_token_count(value).unwrap_or(0);
        bump_stats_async(self.store.clone(), account.email.clone(), 1, 0, tokens);

        let entry = RequestLog::new(
            &account.email,
            model,
            &prompt_text(inbound),
            &response_text(value),
            tokens,
            true,
            system_instruction_text(inbound).as_deref(),
            &[token, &account.refresh_token, &account.access_token],
        );
        log_request_async(self.store.clone(), entry);
    }

    fn record_failure(
        &self,
        account: &GeminiAccount,
        model: &str,
        inbound: &Value,
        body: &str,
        token: &str,
    ) {
        bump_stats_async(self.store.clone(), account.email.clone(), 0, 1, 0);
        let entry = RequestLog::new(
            &account.email,
            model,
            &prompt_text(inbound),
            body,
            0,
            false,
            system_instruction_text(inbound).as_deref(),
            &[token, &account.refresh_token, &account.access_token],
        );
        log_request_async(self.store.clone(), entry);
    }

    /// Keep the LRU ordering current.
    fn touch_account(&self, account: &GeminiAccount) {
        let store = self.store.clone();
        let email = account.email.clone();
        tokio::spawn(async move {
            let patch = AccountPatch {
                last_used_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(e) = store.update_account(&email, patch).await {
                tracing::error!(account = %email, "failed to touch account: {}", e);
            }
        });
    }
}

fn parse_success_body(body: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(body).ok()?;
    let unwrapped = unwrap_envelope(value);
    if has_content(&unwrapped) {
        Some(unwrapped)
    } else {
        None
    }
}

// ── Committed-stream pump ───────────────────────────────────────

struct StreamAccounting {
    store: SharedStore,
    email: String,
    model: String,
    prompt: String,
    system_instruction: Option<String>,
    secrets: Vec<String>,
}

impl StreamAccounting {
    fn finalize(self, tokens: i64, clean: bool) {
        let (successful, failed) = if clean { (1, 0) } else { (0, 1) };
        bump_stats_async(self.store.clone(), self.email.clone(), successful, failed, tokens);

        let secrets: Vec<&str> = self.secrets.iter().map(|s| s.as_str()).collect();
        let entry = RequestLog::new(
            &self.email,
            &self.model,
            &self.prompt,
            "",
            tokens,
            clean,
            self.system_instruction.as_deref(),
            &secrets,
        );
        log_request_async(self.store, entry);
    }
}

struct PumpState {
    byte_stream: BoxStream<'static, reqwest::Result<Bytes>>,
    pipe: SsePipe,
    pending: VecDeque<Bytes>,
    accounting: Option<StreamAccounting>,
    done: bool,
}

/// Pipe the remaining upstream stream to the client. The response is
/// committed, so errors here end the body cleanly (no `[DONE]`, no
/// failover); a natural end appends the terminator and settles accounting.
/// Dropping the body (client disconnect) drops the upstream read with it.
fn pump_body(
    byte_stream: BoxStream<'static, reqwest::Result<Bytes>>,
    pipe: SsePipe,
    pending: VecDeque<Bytes>,
    accounting: StreamAccounting,
) -> Body {
    let state = PumpState {
        byte_stream,
        pipe,
        pending,
        accounting: Some(accounting),
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                return Some((Ok::<Bytes, std::io::Error>(frame), st));
            }
            if st.done {
                return None;
            }
            match st.byte_stream.next().await {
                Some(Ok(bytes)) => {
                    for frame in st.pipe.push_chunk(&bytes) {
                        st.pending.push_back(Bytes::from(format_frame(&frame)));
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("stream error after commit, closing response: {}", e);
                    if let Some(acc) = st.accounting.take() {
                        acc.finalize(st.pipe.token_count().unwrap_or(0), false);
                    }
                    st.done = true;
                    return None;
                }
                None => {
                    if let Some(tail) = st.pipe.flush() {
                        st.pending.push_back(Bytes::from(format_frame(&tail)));
                    }
                    st.pending.push_back(Bytes::from(done_frame()));
                    if let Some(acc) = st.accounting.take() {
                        acc.finalize(st.pipe.token_count().unwrap_or(0), true);
                    }
                    st.done = true;
                }
            }
        }
    });

    Body::from_stream(stream)
}
