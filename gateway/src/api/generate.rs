//! Handlers for the Gemini v1beta model routes.
//!
//! The path carries both model and action in one segment
//! (`gemini-2.5-flash:generateContent`), so the handler splits on the last
//! colon and dispatches.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::proxy::payload::validate_generate_body;
use crate::AppState;

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let (model, action) = model_action
        .rsplit_once(':')
        .ok_or_else(|| AppError::BadRequest("expected models/{model}:{action}".into()))?;
    let model = model.trim().trim_start_matches("models/");

    validate_generate_body(&body).map_err(AppError::BadRequest)?;

    match action {
        "generateContent" => {
            let value = state.engine.generate(Some(model), &body).await?;
            Ok(Json(value).into_response())
        }
        "streamGenerateContent" => {
            let stream_body = state.engine.stream_generate(Some(model), &body).await?;
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(stream_body)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("response build failed: {}", e)))?;
            Ok(response)
        }
        other => Err(AppError::BadRequest(format!("unsupported action: {}", other))),
    }
}

/// Static catalog: the default model plus the fallback chain.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let names = [
        &state.config.default_model,
        &state.config.fallback_model,
        &state.config.fallback_model_v2,
    ];
    let models: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "name": format!("models/{}", name),
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Json(json!({ "models": models }))
}
