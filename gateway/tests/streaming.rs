//! Streaming end-to-end tests: envelope unwrapping, the `[DONE]`
//! terminator, pre-commit failover, and the header-commit trap.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{account, settle, spawn_app, test_config, MemStore, TEST_API_KEY};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STREAM_PATH: &str = "/v1internal:streamGenerateContent";

fn generate_body() -> Value {
    json!({"contents": [{"role": "user", "parts": [{"text": "hello"}]}]})
}

fn sse_frames() -> &'static str {
    concat!(
        "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}}\n\n",
        "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}]}}],\"usageMetadata\":{\"totalTokenCount\":2}}}\n\n",
    )
}

fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
}

/// Upstream envelope frames are unwrapped, the terminator is appended, and
/// the final token count lands on the account.
#[tokio::test]
async fn frames_unwrapped_and_terminated() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(query_param("alt", "sse"))
        .respond_with(sse_response(sse_frames()))
        .expect(1)
        .mount(&upstream)
        .await;

    let store = MemStore::new(vec![account("a@x.com", 0)]);
    let app = spawn_app(test_config(&upstream.uri(), &upstream.uri()), store).await;

    let resp = app
        .client
        .post(app.url("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .bearer_auth(TEST_API_KEY)
        .json(&generate_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");

    let text = resp.text().await.unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|s| !s.is_empty())
        .collect();
    assert_eq!(frames.len(), 3, "unexpected frames: {:?}", frames);

    let first: Value =
        serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(first["candidates"][0]["content"]["parts"][0]["text"], "a");
    assert!(first.get("response").is_none());

    let second: Value =
        serde_json::from_str(frames[1].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(second["candidates"][0]["content"]["parts"][0]["text"], "b");
    assert_eq!(second["usageMetadata"]["totalTokenCount"], 2);

    assert_eq!(frames[2], "data: [DONE]");

    settle().await;
    let a = app.store.account("a@x.com").await;
    assert_eq!(a.total_tokens, 2);
    assert_eq!(a.successful_requests, 1);
}

/// A 2xx whose stream dies before producing any frame is not committed;
/// the engine falls back to the next account.
#[tokio::test]
async fn empty_stream_fails_over_before_commit() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(header("Authorization", "Bearer token-a@x.com"))
        .respond_with(sse_response(""))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(header("Authorization", "Bearer token-b@x.com"))
        .respond_with(sse_response(sse_frames()))
        .expect(1)
        .mount(&upstream)
        .await;

    let store = MemStore::new(vec![account("a@x.com", 0), account("b@x.com", 1)]);
    let app = spawn_app(test_config(&upstream.uri(), &upstream.uri()), store).await;

    let resp = app
        .client
        .post(app.url("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .bearer_auth(TEST_API_KEY)
        .json(&generate_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("\"text\":\"a\""));
    assert!(text.contains("data: [DONE]"));

    settle().await;
    // The barren account cooled down as a timeout-class failure.
    assert!(app.state.cooldown.in_cooldown("a@x.com"));
}

/// Streaming 429 with a successful fallback stream: the fallback is adopted
/// and the primary call leaves no cooldown.
#[tokio::test]
async fn stream_fallback_model_adopted_on_429() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_partial_json(json!({"model": "gemini-2.5-flash"})))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limit"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_partial_json(json!({"model": "gemini-2.5-pro"})))
        .respond_with(sse_response(sse_frames()))
        .expect(1)
        .mount(&upstream)
        .await;

    let store = MemStore::new(vec![account("a@x.com", 0)]);
    let app = spawn_app(test_config(&upstream.uri(), &upstream.uri()), store).await;

    let resp = app
        .client
        .post(app.url("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .bearer_auth(TEST_API_KEY)
        .json(&generate_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("data: [DONE]"));

    settle().await;
    assert!(!app.state.cooldown.in_cooldown("a@x.com"));
}

/// Header-commit trap: once a frame has been delivered, a mid-stream error
/// ends the response cleanly — no `[DONE]`, no second attempt, no 5xx.
#[tokio::test]
async fn mid_stream_error_closes_cleanly_without_retry() {
    let (upstream_url, accepts) = spawn_resetting_sse_server().await;

    let store = MemStore::new(vec![account("a@x.com", 0), account("b@x.com", 1)]);
    let app = spawn_app(test_config(&upstream_url, &upstream_url), store).await;

    let resp = app
        .client
        .post(app.url("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .bearer_auth(TEST_API_KEY)
        .json(&generate_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("\"text\":\"partial\""), "got: {}", text);
    assert!(!text.contains("[DONE]"), "errored stream must not terminate normally");

    settle().await;
    assert_eq!(
        accepts.load(Ordering::SeqCst),
        1,
        "no second account may be attempted after commit"
    );
}

/// Minimal upstream that answers any request with one SSE frame over
/// chunked encoding, then drops the connection without the terminal chunk.
async fn spawn_resetting_sse_server() -> (String, Arc<AtomicUsize>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 65536];
                let _ = socket.read(&mut buf).await;

                let frame = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"partial\"}]}}]}}\n\n";
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                    frame.len(),
                    frame
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.flush().await;
                // Dropping the socket here resets the stream mid-body.
            });
        }
    });

    (format!("http://{}", addr), accepts)
}
