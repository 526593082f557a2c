use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use keyrelay_common::GlobalConfig;
use keyrelay_protocol::openai::{ListModelsResponse, Model, ModelObjectType};
use keyrelay_protocol::openrouter::OpenRouterModelsResponse;
use keyrelay_provider_core::{
    FailureClass, Headers, HttpMethod, RotationError, UpstreamHttpRequest,
    UpstreamHttpResponse, classify_failure, error_message,
};
use keyrelay_storage::UpstreamKey;

use crate::error::ProxyError;
use crate::health;
use crate::state::AppState;

/// What goes back to the client on success or on a relayed upstream error.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ProxyResponse {
    fn relay(resp: UpstreamHttpResponse) -> Self {
        Self {
            status: StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY),
            content_type: resp.content_type().map(str::to_string),
            body: resp.body,
        }
    }

    fn json(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(body),
        }
    }
}

/// Bearer plus the attribution headers OpenRouter expects.
pub fn upstream_headers(config: &GlobalConfig, key: &str) -> Headers {
    vec![
        ("authorization".to_string(), format!("Bearer {key}")),
        ("content-type".to_string(), "application/json".to_string()),
        ("http-referer".to_string(), config.http_referer.clone()),
        ("x-title".to_string(), config.app_title.clone()),
    ]
}

/// Fills `model` when the caller left it out, null or empty.
pub fn apply_default_model(payload: &mut serde_json::Map<String, Value>, default_model: &str) {
    let missing = match payload.get("model") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if missing {
        payload.insert("model".to_string(), Value::String(default_model.to_string()));
    }
}

pub async fn chat_completions(
    state: &AppState,
    keys: &[UpstreamKey],
    body: &[u8],
) -> Result<ProxyResponse, ProxyError> {
    let mut payload: Value = serde_json::from_slice(body)
        .map_err(|_| ProxyError::bad_request("request body must be valid JSON"))?;
    let Value::Object(map) = &mut payload else {
        return Err(ProxyError::bad_request("request body must be a JSON object"));
    };
    let config = state.config();
    apply_default_model(map, &config.default_model);
    let body = Bytes::from(
        serde_json::to_vec(&payload).map_err(|_| ProxyError::internal("internal error"))?,
    );
    let url = format!("{}/chat/completions", config.upstream_base_url);

    let resp = send_with_rotation(state, keys, "chat_completions", |key| UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: url.clone(),
        headers: upstream_headers(&config, &key.value),
        body: Some(body.clone()),
    })
    .await?;
    Ok(ProxyResponse::relay(resp))
}

pub async fn list_models(
    state: &AppState,
    keys: &[UpstreamKey],
) -> Result<ProxyResponse, ProxyError> {
    let config = state.config();
    let url = format!("{}/models", config.upstream_base_url);

    let resp = send_with_rotation(state, keys, "list_models", |key| UpstreamHttpRequest {
        method: HttpMethod::Get,
        url: url.clone(),
        headers: upstream_headers(&config, &key.value),
        body: None,
    })
    .await?;
    if !resp.is_success() {
        return Ok(ProxyResponse::relay(resp));
    }

    let listing = remap_models(&resp.body)?;
    let body = serde_json::to_vec(&listing).map_err(|_| ProxyError::internal("internal error"))?;
    Ok(ProxyResponse::json(StatusCode::OK, body))
}

/// OpenRouter `/models` into the OpenAI list envelope.
#[allow(clippy::result_large_err)]
pub fn remap_models(body: &[u8]) -> Result<ListModelsResponse, ProxyError> {
    let upstream: OpenRouterModelsResponse = serde_json::from_slice(body).map_err(|err| {
        warn!(event = "models_decode_failed", error = %err);
        ProxyError::internal("failed to fetch model list")
    })?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let data = upstream
        .data
        .into_iter()
        .map(|m| {
            let owned_by = m
                .owned_by
                .filter(|o| !o.is_empty())
                .or_else(|| {
                    m.id.split_once('/')
                        .map(|(vendor, _)| vendor.to_string())
                        .filter(|v| !v.is_empty())
                })
                .unwrap_or_else(|| "openrouter".to_string());
            Model {
                object: ModelObjectType::Model,
                created: m.created.map(|c| c as i64).unwrap_or(now),
                owned_by,
                id: m.id,
            }
        })
        .collect();
    Ok(ListModelsResponse::new(data))
}

/// Sends with the next key; on a quota-class failure marks that key unhealthy and
/// retries exactly once on the key after it.
async fn send_with_rotation<F>(
    state: &AppState,
    keys: &[UpstreamKey],
    op: &'static str,
    build: F,
) -> Result<UpstreamHttpResponse, ProxyError>
where
    F: Fn(&UpstreamKey) -> UpstreamHttpRequest,
{
    let config = state.config();
    let policy = config.exhausted_policy;
    let cooldown = Duration::from_secs(config.quota_cooldown_secs);
    health::sweep_if_due(state, keys).await;

    let statuses = state.key_health(keys);
    let idx = state
        .cursor
        .advance(&statuses, policy)
        .map_err(ProxyError::from_rotation)?;
    let first = &keys[idx];

    let resp = send_once(state, first, op, 1, &build).await?;
    if classify_failure(&resp) != FailureClass::Quota {
        return Ok(resp);
    }

    warn!(
        event = "upstream_quota",
        op,
        key = %first.name,
        status = resp.status,
        message = %error_message(&resp.body).unwrap_or_default()
    );
    state.health.mark_exhausted(&first.name, cooldown);

    let statuses = state.key_health(keys);
    let retry_idx = match state.cursor.advance_after_failure(&statuses, idx, policy) {
        Ok(i) => i,
        Err(RotationError::NoAlternativeKey | RotationError::NoHealthyKey) => {
            return Err(ProxyError::quota_exhausted());
        }
        Err(err) => return Err(ProxyError::from_rotation(err)),
    };
    if let Err(err) = state.store.save_cursor(retry_idx).await {
        warn!(event = "cursor_persist_failed", error = %err);
    }

    let retry = &keys[retry_idx];
    info!(event = "upstream_rotate", op, from = %first.name, to = %retry.name);
    let resp = send_once(state, retry, op, 2, &build).await?;
    if classify_failure(&resp) == FailureClass::Quota {
        state.health.mark_exhausted(&retry.name, cooldown);
    }
    Ok(resp)
}

async fn send_once<F>(
    state: &AppState,
    key: &UpstreamKey,
    op: &'static str,
    attempt: u32,
    build: &F,
) -> Result<UpstreamHttpResponse, ProxyError>
where
    F: Fn(&UpstreamKey) -> UpstreamHttpRequest,
{
    let started = Instant::now();
    let result = state.upstream.send(build(key)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(resp) => {
            if resp.is_success() {
                state.stats.record_success(&key.name);
            } else {
                state.stats.record_error(&key.name);
            }
            info!(
                event = "upstream_response",
                op,
                attempt,
                key = %key.name,
                status = resp.status,
                elapsed_ms
            );
            Ok(resp)
        }
        Err(err) => {
            state.stats.record_error(&key.name);
            warn!(
                event = "upstream_transport_error",
                op,
                attempt,
                key = %key.name,
                kind = err.kind.as_str(),
                error = %err.message,
                elapsed_ms
            );
            Err(ProxyError::upstream_transport())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_model_fills_missing_null_and_blank() {
        for body in [json!({}), json!({"model": null}), json!({"model": "  "})] {
            let Value::Object(mut map) = body else {
                unreachable!()
            };
            apply_default_model(&mut map, "m/default");
            assert_eq!(map["model"], "m/default");
        }
        let Value::Object(mut map) = json!({"model": "openai/gpt-4o"}) else {
            unreachable!()
        };
        apply_default_model(&mut map, "m/default");
        assert_eq!(map["model"], "openai/gpt-4o");
    }

    #[test]
    fn models_are_remapped_into_openai_list() {
        let body = br#"{"data":[
            {"id":"openai/gpt-4o","name":"GPT-4o","created":1715367049},
            {"id":"plainmodel","owned_by":"acme"},
            {"id":"nomodelvendor"}
        ]}"#;
        let listing = remap_models(body).unwrap();
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["object"], "list");
        assert_eq!(value["data"][0]["id"], "openai/gpt-4o");
        assert_eq!(value["data"][0]["object"], "model");
        assert_eq!(value["data"][0]["created"], 1715367049);
        assert_eq!(value["data"][0]["owned_by"], "openai");
        assert_eq!(value["data"][1]["owned_by"], "acme");
        assert_eq!(value["data"][2]["owned_by"], "openrouter");
        assert!(value["data"][2]["created"].as_i64().unwrap() > 0);
    }

    #[test]
    fn undecodable_models_body_is_internal_error() {
        let err = remap_models(b"<html>").unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
