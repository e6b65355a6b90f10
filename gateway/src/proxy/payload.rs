//! Inbound body handling and the Code-Assist wire envelope.
//!
//! Request and response shapes are open-ended JSON; only the documented
//! paths are interpreted, everything else passes through verbatim.

use serde_json::{json, Map, Value};

use crate::config::Config;

/// Alias commonly sent by clients but not accepted natively by the upstream.
const UNSUPPORTED_PREVIEW_ALIAS: &str = "gemini-3.1-pro-preview";

/// Validate the inbound generate body: `contents` must exist and be a
/// non-empty array.
pub fn validate_generate_body(body: &Value) -> Result<(), String> {
    match body.get("contents") {
        None => Err("missing required field: contents".into()),
        Some(Value::Array(items)) => {
            if items.is_empty() {
                Err("contents must not be empty".into())
            } else {
                Ok(())
            }
        }
        Some(_) => Err("contents must be an array".into()),
    }
}

/// Resolve the model to call first. An absent model falls back to the
/// configured default; the unsupported preview alias is rewritten up front.
pub fn resolve_model(requested: Option<&str>, cfg: &Config) -> String {
    match requested {
        None | Some("") => cfg.default_model.clone(),
        Some(UNSUPPORTED_PREVIEW_ALIAS) => cfg.fallback_model.clone(),
        Some(m) => m.to_string(),
    }
}

/// The next model in the fallback chain, tried once after a 429.
pub fn next_fallback_model(current: &str, cfg: &Config) -> Option<String> {
    if current == cfg.default_model {
        Some(cfg.fallback_model.clone())
    } else if current == cfg.fallback_model {
        Some(cfg.fallback_model_v2.clone())
    } else {
        None
    }
}

/// Build the Code-Assist request envelope:
/// `{model, project, user_prompt_id, request:{contents, …}}`.
/// Optional inbound fields are only forwarded when present, and the legacy
/// `tool_config` alias is coalesced into `toolConfig`.
pub fn build_upstream_body(model: &str, project: &str, inbound: &Value) -> Value {
    let mut request = Map::new();
    request.insert(
        "contents".into(),
        contents_with_default_roles(inbound.get("contents").cloned().unwrap_or(Value::Null)),
    );

    for field in ["generationConfig", "systemInstruction", "tools"] {
        if let Some(v) = inbound.get(field) {
            request.insert(field.into(), v.clone());
        }
    }
    if let Some(v) = inbound.get("toolConfig").or_else(|| inbound.get("tool_config")) {
        request.insert("toolConfig".into(), v.clone());
    }

    json!({
        "model": model,
        "project": project,
        "user_prompt_id": "default-prompt",
        "request": Value::Object(request),
    })
}

/// Entries without a role are the user's.
fn contents_with_default_roles(contents: Value) -> Value {
    match contents {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|mut entry| {
                    if let Value::Object(obj) = &mut entry {
                        obj.entry("role").or_insert_with(|| Value::String("user".into()));
                    }
                    entry
                })
                .collect(),
        ),
        other => other,
    }
}

/// Unwrap the upstream `{response:{…}, usageMetadata?:{…}}` envelope.
/// Outer usage metadata is merged into the inner object, inner keys winning.
/// Already-unwrapped values come back unchanged.
pub fn unwrap_envelope(value: Value) -> Value {
    let Value::Object(mut outer) = value else {
        return value;
    };

    let Some(inner) = outer.remove("response") else {
        return Value::Object(outer);
    };

    let Value::Object(mut inner) = inner else {
        return inner;
    };

    if let Some(Value::Object(outer_usage)) = outer.remove("usageMetadata") {
        match inner.get_mut("usageMetadata") {
            Some(Value::Object(inner_usage)) => {
                for (k, v) in outer_usage {
                    inner_usage.entry(k).or_insert(v);
                }
            }
            _ => {
                inner.insert("usageMetadata".into(), Value::Object(outer_usage));
            }
        }
    }

    Value::Object(inner)
}

/// `usageMetadata.totalTokenCount`, wherever the frame put it.
pub fn total_token_count(value: &Value) -> Option<i64> {
    value
        .get("usageMetadata")
        .or_else(|| value.get("response").and_then(|r| r.get("usageMetadata")))
        .and_then(|u| u.get("totalTokenCount"))
        .and_then(|v| v.as_i64())
}

/// True when the (unwrapped) response carries at least one candidate with
/// non-empty content parts.
pub fn has_content(value: &Value) -> bool {
    value
        .get("candidates")
        .and_then(|c| c.as_array())
        .map(|candidates| {
            candidates.iter().any(|cand| {
                cand.get("content")
                    .and_then(|c| c.get("parts"))
                    .and_then(|p| p.as_array())
                    .map(|parts| !parts.is_empty())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Concatenated text parts of the last content entry, for the request log.
pub fn prompt_text(inbound: &Value) -> String {
    inbound
        .get("contents")
        .and_then(|c| c.as_array())
        .and_then(|items| items.last())
        .map(|entry| text_of_parts(entry))
        .unwrap_or_default()
}

/// System instruction text, if the request set one.
pub fn system_instruction_text(inbound: &Value) -> Option<String> {
    inbound.get("systemInstruction").map(text_of_parts)
}

/// Concatenated candidate text of an unwrapped response.
pub fn response_text(value: &Value) -> String {
    value
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|candidates| candidates.first())
        .map(text_of_parts)
        .unwrap_or_default()
}

fn text_of_parts(entry: &Value) -> String {
    entry
        .get("content")
        .unwrap_or(entry)
        .get("parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
