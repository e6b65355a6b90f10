use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::AppState;

pub mod generate;

/// Large tool schemas are routine; the limit exists to bound abuse, not use.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Build the public v1beta router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1beta/models", get(generate::list_models))
        .route("/v1beta/models/:model_action", post(generate::dispatch))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Middleware: every model route needs a valid `sk-` client credential,
/// accepted as a bearer token, the `x-goog-api-key` header, or `?key=`.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = extract_api_key(&req).ok_or(AppError::Unauthorized)?;

    if !state
        .store
        .validate_api_key(&key)
        .await
        .map_err(AppError::Internal)?
    {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(req).await)
}

fn extract_api_key(req: &Request) -> Option<String> {
    let headers = req.headers();

    let candidate = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or_else(|| {
            headers
                .get("x-goog-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|t| t.trim().to_string())
        })
        .or_else(|| query_param(req.uri().query()?, "key"));

    candidate.filter(|k| k.starts_with("sk-"))
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name && !v.is_empty()).then(|| v.to_string())
    })
}

/// Liveness plus a pool summary. Unauthenticated.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "accounts": state.accounts.cached_count().await,
        "cooling_down": state.cooldown.active_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_extraction() {
        assert_eq!(query_param("key=sk-abc", "key").as_deref(), Some("sk-abc"));
        assert_eq!(
            query_param("alt=sse&key=sk-abc", "key").as_deref(),
            Some("sk-abc")
        );
        assert_eq!(query_param("key=", "key"), None);
        assert_eq!(query_param("other=x", "key"), None);
    }
}
