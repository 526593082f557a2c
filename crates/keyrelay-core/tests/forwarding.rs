use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde_json::{Value, json};

use keyrelay_common::{ExhaustedPolicy, GlobalConfigPatch, PasswordCost};
use keyrelay_core::forwarder::{chat_completions, list_models};
use keyrelay_core::health::{force_sweep, sweep_if_due};
use keyrelay_core::{AppState, UpstreamClient};
use keyrelay_provider_core::{
    HealthStatus, HttpMethod, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind, header_get,
};
use keyrelay_storage::{MemoryKvStore, UpstreamKey};

type Responder =
    dyn Fn(&UpstreamHttpRequest) -> Result<UpstreamHttpResponse, UpstreamFailure> + Send + Sync;

struct ScriptedUpstream {
    calls: Mutex<Vec<UpstreamHttpRequest>>,
    responder: Box<Responder>,
}

impl ScriptedUpstream {
    fn new(
        responder: impl Fn(&UpstreamHttpRequest) -> Result<UpstreamHttpResponse, UpstreamFailure>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    fn calls(&self) -> Vec<UpstreamHttpRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        let result = (self.responder)(&req);
        self.calls.lock().unwrap().push(req);
        Box::pin(async move { result })
    }
}

fn bearer(req: &UpstreamHttpRequest) -> String {
    header_get(&req.headers, "authorization")
        .unwrap_or_default()
        .trim_start_matches("Bearer ")
        .to_string()
}

fn json_response(status: u16, body: Value) -> UpstreamHttpResponse {
    UpstreamHttpResponse {
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from(body.to_string()),
    }
}

fn rate_limited() -> UpstreamHttpResponse {
    json_response(
        429,
        json!({"error": {"message": "Rate limit exceeded: free-models-per-min", "code": 429}}),
    )
}

/// Answers probes after `delay`; requests made with `stalled_key` never complete.
struct SlowUpstream {
    delay: Duration,
    stalled_key: &'static str,
    calls: AtomicUsize,
}

impl SlowUpstream {
    fn new(delay: Duration, stalled_key: &'static str) -> Arc<Self> {
        Arc::new(Self {
            delay,
            stalled_key,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for SlowUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stalled = bearer(&req) == self.stalled_key;
        Box::pin(async move {
            if stalled {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.delay).await;
            Ok(json_response(200, json!({"data": []})))
        })
    }
}

fn state_with(upstream: Arc<ScriptedUpstream>, interval: u64, policy: ExhaustedPolicy) -> AppState {
    state_from(
        upstream,
        GlobalConfigPatch {
            health_check_interval_secs: Some(interval),
            exhausted_policy: Some(policy),
            ..Default::default()
        },
    )
}

fn state_from(upstream: Arc<dyn UpstreamClient>, overrides: GlobalConfigPatch) -> AppState {
    let mut patch = GlobalConfigPatch {
        dsn: Some("memory://".to_string()),
        upstream_base_url: Some("http://upstream.test/api/v1".to_string()),
        password_cost: Some(PasswordCost {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }),
        ..Default::default()
    };
    patch.overlay(overrides);
    let config = patch.into_config().unwrap();
    AppState::new(config, Arc::new(MemoryKvStore::new()), upstream, 0).unwrap()
}

fn keys(names: &[&str]) -> Vec<UpstreamKey> {
    names
        .iter()
        .map(|n| UpstreamKey::new(*n, format!("sk-or-{n}")))
        .collect()
}

fn body_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn zero_keys_is_service_unavailable() {
    let upstream = ScriptedUpstream::new(|_| unreachable!("no upstream call expected"));
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    let err = chat_completions(&state, &[], br#"{"messages":[]}"#)
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(&err.body)["error"]["message"],
        "no API keys configured"
    );
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn single_key_quota_failure_returns_quota_envelope() {
    let upstream = ScriptedUpstream::new(|_| Ok(rate_limited()));
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    let err = chat_completions(&state, &keys(&["only"]), br#"{"messages":[]}"#)
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(&err.body);
    assert_eq!(body["error"]["type"], "insufficient_quota");
    assert!(!String::from_utf8_lossy(&err.body).contains("free-models-per-min"));
    assert_eq!(upstream.calls().len(), 1);
    assert_eq!(state.health.status("only"), HealthStatus::Unhealthy);
}

#[tokio::test]
async fn quota_failure_retries_once_on_next_key() {
    let upstream = ScriptedUpstream::new(|req| {
        if bearer(req) == "sk-or-b" {
            Ok(rate_limited())
        } else {
            Ok(json_response(200, json!({"id": "chatcmpl-1", "choices": []})))
        }
    });
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);
    let keys = keys(&["a", "b", "c"]);

    // Cursor 0 selects "b" first.
    let resp = chat_completions(&state, &keys, br#"{"model":"x/y","messages":[]}"#)
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(body_json(&resp.body)["id"], "chatcmpl-1");

    let used: Vec<String> = upstream.calls().iter().map(bearer).collect();
    assert_eq!(used, ["sk-or-b", "sk-or-c"]);
    assert_eq!(state.health.status("b"), HealthStatus::Unhealthy);
    assert_eq!(state.cursor.get(), 2);
    assert_eq!(state.store.load_cursor().await.unwrap(), 2);
    assert_eq!(state.stats.get("b").errors, 1);
    assert_eq!(state.stats.get("c").usage, 1);
}

#[tokio::test]
async fn failed_retry_is_relayed_not_retried_again() {
    let upstream = ScriptedUpstream::new(|_| Ok(rate_limited()));
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    let resp = chat_completions(&state, &keys(&["a", "b", "c"]), br#"{"messages":[]}"#)
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(upstream.calls().len(), 2);
}

#[tokio::test]
async fn non_quota_errors_are_relayed_verbatim() {
    let upstream = ScriptedUpstream::new(|_| {
        Ok(json_response(
            400,
            json!({"error": {"message": "x/unknown is not a valid model ID", "code": 400}}),
        ))
    });
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    let resp = chat_completions(&state, &keys(&["a", "b"]), br#"{"model":"x/unknown"}"#)
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.content_type.as_deref(), Some("application/json"));
    assert_eq!(
        body_json(&resp.body)["error"]["message"],
        "x/unknown is not a valid model ID"
    );
    assert_eq!(upstream.calls().len(), 1);
    assert_eq!(state.health.status("b"), HealthStatus::Unknown);
}

#[tokio::test]
async fn chat_request_gets_default_model_and_attribution_headers() {
    let upstream = ScriptedUpstream::new(|_| Ok(json_response(200, json!({"ok": true}))));
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    chat_completions(&state, &keys(&["a"]), br#"{"messages":[{"role":"user","content":"hi"}]}"#)
        .await
        .unwrap();

    let call = &upstream.calls()[0];
    assert_eq!(call.method, HttpMethod::Post);
    assert_eq!(call.url, "http://upstream.test/api/v1/chat/completions");
    assert_eq!(header_get(&call.headers, "Authorization"), Some("Bearer sk-or-a"));
    assert_eq!(
        header_get(&call.headers, "HTTP-Referer"),
        Some(state.config().http_referer.as_str())
    );
    assert_eq!(
        header_get(&call.headers, "X-Title"),
        Some(state.config().app_title.as_str())
    );
    let sent = body_json(call.body.as_ref().unwrap());
    assert_eq!(sent["model"], state.config().default_model.as_str());
    assert_eq!(sent["messages"][0]["content"], "hi");
}

#[tokio::test]
async fn invalid_json_body_is_bad_request() {
    let upstream = ScriptedUpstream::new(|_| unreachable!("no upstream call expected"));
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    for body in [&b"{not json"[..], &b"[1,2]"[..]] {
        let err = chat_completions(&state, &keys(&["a"]), body)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn transport_failure_is_internal_error() {
    let upstream = ScriptedUpstream::new(|_| {
        Err(UpstreamFailure::new(
            UpstreamTransportErrorKind::Connect,
            "connection refused",
        ))
    });
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    let err = list_models(&state, &keys(&["a", "b"])).await.unwrap_err();
    assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(&err.body)["error"]["type"], "api_error");
    assert_eq!(upstream.calls().len(), 1);
}

#[tokio::test]
async fn models_listing_is_remapped() {
    let upstream = ScriptedUpstream::new(|_| {
        Ok(json_response(
            200,
            json!({"data": [{"id": "deepseek/deepseek-chat", "created": 1700000000}]}),
        ))
    });
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    let resp = list_models(&state, &keys(&["a"])).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(
        body_json(&resp.body),
        json!({
            "object": "list",
            "data": [{
                "id": "deepseek/deepseek-chat",
                "object": "model",
                "created": 1700000000,
                "owned_by": "deepseek"
            }]
        })
    );
    assert_eq!(upstream.calls()[0].url, "http://upstream.test/api/v1/models");
}

#[tokio::test]
async fn due_sweep_probes_every_key_and_skips_unhealthy_ones() {
    let upstream = ScriptedUpstream::new(|req| {
        let key = bearer(req);
        match (req.method, key.as_str()) {
            (HttpMethod::Get, "sk-or-b") => Ok(json_response(401, json!({"error": {"message": "bad key"}}))),
            (HttpMethod::Get, _) => Ok(json_response(200, json!({"data": []}))),
            (HttpMethod::Post, _) => Ok(json_response(200, json!({"ok": true}))),
        }
    });
    let state = state_with(upstream.clone(), 300, ExhaustedPolicy::FallbackFirst);
    let keys = keys(&["a", "b", "c"]);

    chat_completions(&state, &keys, br#"{}"#).await.unwrap();

    let calls = upstream.calls();
    let probes = calls.iter().filter(|c| c.method == HttpMethod::Get).count();
    assert_eq!(probes, 3);
    let post = calls.iter().find(|c| c.method == HttpMethod::Post).unwrap();
    assert_eq!(bearer(post), "sk-or-c");
    assert_eq!(state.health.status("a"), HealthStatus::Healthy);
    assert_eq!(state.health.status("b"), HealthStatus::Unhealthy);

    // Not due again within the interval.
    chat_completions(&state, &keys, br#"{}"#).await.unwrap();
    let probes = upstream
        .calls()
        .iter()
        .filter(|c| c.method == HttpMethod::Get)
        .count();
    assert_eq!(probes, 3);
}

#[tokio::test]
async fn all_unhealthy_keys_follow_configured_policy() {
    let upstream = ScriptedUpstream::new(|_| Ok(json_response(200, json!({"ok": true}))));
    let keys = keys(&["a", "b"]);

    let lenient = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);
    lenient.health.mark("a", HealthStatus::Unhealthy);
    lenient.health.mark("b", HealthStatus::Unhealthy);
    let resp = chat_completions(&lenient, &keys, br#"{}"#).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(bearer(&upstream.calls()[0]), "sk-or-a");

    let strict = state_with(upstream.clone(), 0, ExhaustedPolicy::Reject);
    strict.health.mark("a", HealthStatus::Unhealthy);
    strict.health.mark("b", HealthStatus::Unhealthy);
    let err = chat_completions(&strict, &keys, br#"{}"#).await.unwrap_err();
    assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(&err.body)["error"]["message"],
        "no healthy API key available"
    );
}

#[tokio::test]
async fn persisted_health_flag_seeds_unknown_keys() {
    let upstream = ScriptedUpstream::new(|_| Ok(json_response(200, json!({"ok": true}))));
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::Reject);
    let mut keys = keys(&["a", "b"]);
    keys[1].is_healthy = Some(false);

    chat_completions(&state, &keys, br#"{}"#).await.unwrap();
    assert_eq!(bearer(&upstream.calls()[0]), "sk-or-a");
}

#[tokio::test]
async fn quota_mark_lapses_after_cooldown() {
    let upstream = ScriptedUpstream::new(|_| Ok(rate_limited()));
    let state = state_from(
        upstream.clone(),
        GlobalConfigPatch {
            health_check_interval_secs: Some(0),
            quota_cooldown_secs: Some(0),
            exhausted_policy: Some(ExhaustedPolicy::Reject),
            ..Default::default()
        },
    );
    let keys = keys(&["only"]);

    chat_completions(&state, &keys, br#"{}"#).await.unwrap_err();
    assert_eq!(state.health.status("only"), HealthStatus::Unknown);

    // Still eligible under the strict policy, so the key is tried again.
    chat_completions(&state, &keys, br#"{}"#).await.unwrap_err();
    assert_eq!(upstream.calls().len(), 2);
}

#[tokio::test]
async fn quota_mark_holds_until_cooldown_with_sweeps_off() {
    let upstream = ScriptedUpstream::new(|_| Ok(rate_limited()));
    let state = state_from(
        upstream.clone(),
        GlobalConfigPatch {
            health_check_interval_secs: Some(0),
            quota_cooldown_secs: Some(3600),
            exhausted_policy: Some(ExhaustedPolicy::Reject),
            ..Default::default()
        },
    );
    let keys = keys(&["only"]);

    chat_completions(&state, &keys, br#"{}"#).await.unwrap_err();
    let err = chat_completions(&state, &keys, br#"{}"#).await.unwrap_err();
    assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.calls().len(), 1);
}

#[tokio::test]
async fn transport_error_marks_key_unhealthy_on_sweep() {
    let upstream = ScriptedUpstream::new(|req| {
        if bearer(req) == "sk-or-b" {
            Err(UpstreamFailure::new(
                UpstreamTransportErrorKind::Dns,
                "no such host",
            ))
        } else {
            Ok(json_response(200, json!({"data": []})))
        }
    });
    let state = state_with(upstream.clone(), 0, ExhaustedPolicy::FallbackFirst);

    assert!(force_sweep(&state, &keys(&["a", "b"])).await);
    assert_eq!(state.health.status("a"), HealthStatus::Healthy);
    assert_eq!(state.health.status("b"), HealthStatus::Unhealthy);
    assert!(
        upstream
            .calls()
            .iter()
            .all(|c| c.method == HttpMethod::Get && c.url.ends_with("/models"))
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_key_marked_unhealthy_after_timeout() {
    let upstream = SlowUpstream::new(Duration::from_millis(10), "sk-or-slow");
    let state = state_from(
        upstream.clone(),
        GlobalConfigPatch {
            health_probe_timeout_secs: Some(2),
            ..Default::default()
        },
    );

    let started = tokio::time::Instant::now();
    assert!(force_sweep(&state, &keys(&["fast", "slow"])).await);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(state.health.status("fast"), HealthStatus::Healthy);
    assert_eq!(state.health.status("slow"), HealthStatus::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn overlapping_sweeps_check_each_key_once() {
    let upstream = SlowUpstream::new(Duration::from_secs(1), "");
    let state = state_from(
        upstream.clone(),
        GlobalConfigPatch {
            health_check_interval_secs: Some(300),
            ..Default::default()
        },
    );
    let keys = keys(&["a", "b", "c"]);

    tokio::join!(sweep_if_due(&state, &keys), sweep_if_due(&state, &keys));
    assert_eq!(upstream.calls(), 3);
    assert_eq!(state.health.status("b"), HealthStatus::Healthy);

    let (first, second) = tokio::join!(force_sweep(&state, &keys), force_sweep(&state, &keys));
    assert!(first ^ second);
    assert_eq!(upstream.calls(), 6);

    // Not due again within the interval.
    sweep_if_due(&state, &keys).await;
    assert_eq!(upstream.calls(), 6);
}
