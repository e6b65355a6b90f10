//! Thin wrapper around the HTTP stack for Code-Assist calls.
//!
//! Bodies are always sent as full buffers so `Content-Length` is set on
//! every request — the upstream OAuth and Code-Assist endpoints hang on
//! chunked transfer encoding.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::Client;

/// Exactly the headers the upstream accepts; it rejects requests without
/// this client identification.
pub fn code_assist_headers(access_token: &str) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", access_token))
            .map_err(|_| anyhow::anyhow!("access token is not header-safe"))?,
    );
    headers.insert("Content-Type", HeaderValue::from_static("application/json"));
    headers.insert(
        "X-Goog-Api-Client",
        HeaderValue::from_static("gl-node/openclaw"),
    );
    headers.insert(
        "User-Agent",
        HeaderValue::from_static("GeminiCLI/0.26.0 (darwin; arm64)"),
    );
    Ok(headers)
}

/// A fully-buffered unary exchange.
#[derive(Debug)]
pub struct UnaryExchange {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

impl UnaryExchange {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A streaming exchange; the body is consumed by the caller.
pub struct StreamingExchange {
    pub status: u16,
    pub retry_after: Option<String>,
    pub response: reqwest::Response,
}

#[derive(Clone)]
pub struct UpstreamClient {
    unary: Client,
    streaming: Client,
}

impl UpstreamClient {
    pub fn new(unary_timeout: Duration, stream_read_timeout: Duration) -> Self {
        let unary = Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(5))
            .timeout(unary_timeout)
            .build()
            .expect("failed to build unary HTTP client");

        // No total deadline for streams; stalls are bounded by the read
        // timeout instead.
        let streaming = Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(5))
            .read_timeout(stream_read_timeout)
            .build()
            .expect("failed to build streaming HTTP client");

        Self { unary, streaming }
    }

    pub async fn post_unary(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> anyhow::Result<UnaryExchange> {
        let resp = self
            .unary
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("upstream request failed: {}", e))?;

        let status = resp.status().as_u16();
        let retry_after = header_string(resp.headers(), RETRY_AFTER);
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("upstream body read failed: {}", e))?;

        Ok(UnaryExchange {
            status,
            retry_after,
            body,
        })
    }

    /// Open a streaming call and hand back the live response. Never retried
    /// here — stream rotation belongs to the engine.
    pub async fn post_streaming(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> anyhow::Result<StreamingExchange> {
        let response = self
            .streaming
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("upstream streaming request failed: {}", e))?;

        Ok(StreamingExchange {
            status: response.status().as_u16(),
            retry_after: header_string(response.headers(), RETRY_AFTER),
            response,
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
