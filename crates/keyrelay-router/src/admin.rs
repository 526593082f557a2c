use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use serde::Deserialize;
use serde_json::json;

use keyrelay_core::admin;
use keyrelay_core::{AdminError, AdminSession, AppState};

pub fn admin_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/auth/change-password", post(change_password))
        .route("/keys", get(list_keys).post(add_key))
        .route("/keys/check", post(check_keys))
        .route("/keys/{name}", delete(delete_key))
        .route("/tokens", get(list_tokens).post(create_token))
        .route("/tokens/{name}", patch(update_token).delete(delete_token))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new()
        .route("/auth/status", get(auth_status))
        .route("/auth/setup", post(setup))
        .route("/auth/login", post(login))
        .merge(protected)
        .with_state(state)
}

async fn admin_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut req: Request,
    next: Next,
) -> Response {
    match admin::authorize(&state, &headers).await {
        Ok(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        Err(err) => admin_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct PasswordBody {
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordBody {
    #[serde(default)]
    current_password: String,
    #[serde(default)]
    new_password: String,
}

#[derive(Debug, Deserialize)]
struct AddKeyBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct CreateTokenBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateTokenBody {
    enabled: bool,
}

async fn auth_status(State(state): State<Arc<AppState>>) -> Response {
    match admin::auth_status(&state).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn setup(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PasswordBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match admin::setup_password(&state, &body.password).await {
        Ok(()) => success("admin password set"),
        Err(err) => admin_error(err),
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PasswordBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match admin::login(&state, &body.password).await {
        Ok(()) => success("login successful"),
        Err(err) => admin_error(err),
    }
}

async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<AdminSession>,
    body: Result<Json<ChangePasswordBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match admin::change_password(&state, &session, &body.current_password, &body.new_password)
        .await
    {
        Ok(()) => success("admin password changed"),
        Err(err) => admin_error(err),
    }
}

async fn list_keys(State(state): State<Arc<AppState>>) -> Response {
    match admin::list_keys(&state).await {
        Ok(keys) => Json(json!({ "success": true, "keys": keys })).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn add_key(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AddKeyBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match admin::add_key(&state, &body.name, &body.value).await {
        Ok(key) => Json(json!({
            "success": true,
            "message": "key added",
            "key": key,
        }))
        .into_response(),
        Err(err) => admin_error(err),
    }
}

async fn delete_key(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match admin::delete_key(&state, &name).await {
        Ok(()) => success("key deleted"),
        Err(err) => admin_error(err),
    }
}

async fn check_keys(State(state): State<Arc<AppState>>) -> Response {
    match admin::check_keys(&state).await {
        Ok(keys) => Json(json!({ "success": true, "keys": keys })).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn list_tokens(State(state): State<Arc<AppState>>) -> Response {
    match admin::list_tokens(&state).await {
        Ok(tokens) => Json(json!({ "success": true, "tokens": tokens })).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn create_token(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTokenBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match admin::create_token(&state, &body.name, body.token.as_deref()).await {
        Ok(token) => Json(json!({
            "success": true,
            "message": "token created",
            "token": token,
        }))
        .into_response(),
        Err(err) => admin_error(err),
    }
}

async fn update_token(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Result<Json<UpdateTokenBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match admin::set_token_enabled(&state, &name, body.enabled).await {
        Ok(token) => Json(json!({ "success": true, "token": token })).into_response(),
        Err(err) => admin_error(err),
    }
}

async fn delete_token(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match admin::delete_token(&state, &name).await {
        Ok(()) => success("token deleted"),
        Err(err) => admin_error(err),
    }
}

fn success(message: &str) -> Response {
    Json(json!({ "success": true, "message": message })).into_response()
}

fn admin_error(err: AdminError) -> Response {
    if err.status().is_server_error() {
        tracing::error!(event = "admin_error", error = %err);
    }
    (
        err.status(),
        Json(json!({ "error": err.public_message() })),
    )
        .into_response()
}

fn bad_json(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("invalid request body: {}", rejection.body_text()) })),
    )
        .into_response()
}
