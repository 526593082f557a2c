use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Extension, Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use tracing::info;

use keyrelay_core::forwarder;
use keyrelay_core::{AppState, ProxyError, ProxyResponse, TokenRegistry, authenticate_client};
use keyrelay_storage::UpstreamKey;

const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
struct RequestTraceId(String);

/// Upstream keys loaded alongside the token check, reused by the handler.
#[derive(Clone)]
struct LoadedKeys(Arc<Vec<UpstreamKey>>);

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(models_list))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn proxy_auth(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let snapshot = match state.store.load_all().await {
        Ok(snapshot) => snapshot,
        Err(err) => return error_response(ProxyError::from(err)),
    };
    let registry = TokenRegistry::new(snapshot.client_tokens);
    let token_name = match authenticate_client(req.headers(), &registry) {
        Ok(token) => token.name.clone(),
        Err(err) => {
            info!(
                event = "downstream_rejected",
                trace_id = %trace_id,
                method = %method,
                path = %path,
                status = err.status.as_u16()
            );
            return error_response(err);
        }
    };

    // Client credentials stop here.
    req.headers_mut().remove(header::AUTHORIZATION);
    req.extensions_mut()
        .insert(RequestTraceId(trace_id.clone()));
    req.extensions_mut()
        .insert(LoadedKeys(Arc::new(snapshot.upstream_keys)));

    let resp = next.run(req).await;
    info!(
        event = "downstream_request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        token_name = %token_name,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    resp
}

async fn models_list(
    State(state): State<Arc<AppState>>,
    Extension(LoadedKeys(keys)): Extension<LoadedKeys>,
) -> Response {
    match forwarder::list_models(&state, &keys).await {
        Ok(resp) => proxy_response(resp),
        Err(err) => error_response(err),
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(LoadedKeys(keys)): Extension<LoadedKeys>,
    Extension(RequestTraceId(trace_id)): Extension<RequestTraceId>,
    body: Bytes,
) -> Response {
    tracing::debug!(event = "chat_request", trace_id = %trace_id, bytes = body.len());
    match forwarder::chat_completions(&state, &keys, &body).await {
        Ok(resp) => proxy_response(resp),
        Err(err) => error_response(err),
    }
}

fn proxy_response(resp: ProxyResponse) -> Response {
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    let content_type = resp
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    out.headers_mut().insert(header::CONTENT_TYPE, content_type);
    out
}

fn error_response(err: ProxyError) -> Response {
    (
        err.status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        err.body,
    )
        .into_response()
}
