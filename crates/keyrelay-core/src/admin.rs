use http::{HeaderMap, StatusCode};
use serde::Serialize;
use tracing::{info, warn};

use keyrelay_provider_core::HealthStatus;
use keyrelay_storage::{ClientToken, StorageError, UpstreamKey};

use crate::auth::extract_bearer;
use crate::health;
use crate::password::{PasswordError, Verification, is_acceptable_password};
use crate::state::AppState;
use crate::tokens::{TokenError, TokenRegistry};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("admin password not configured")]
    NotConfigured,
    #[error("invalid admin password")]
    InvalidPassword,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Password(#[from] PasswordError),
}

impl AdminError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::MissingCredentials | AdminError::InvalidPassword => {
                StatusCode::UNAUTHORIZED
            }
            AdminError::NotConfigured => StatusCode::FORBIDDEN,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Conflict(_) => StatusCode::CONFLICT,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Storage(_) | AdminError::Password(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing text; internal failures are not described.
    pub fn public_message(&self) -> String {
        match self {
            AdminError::Storage(_) | AdminError::Password(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<TokenError> for AdminError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidName => AdminError::BadRequest(err.to_string()),
            TokenError::NameTaken | TokenError::TokenTaken => AdminError::Conflict(err.to_string()),
            TokenError::NotFound => AdminError::NotFound(err.to_string()),
        }
    }
}

/// Names that collide with fixed routes under `/keys`.
const RESERVED_KEY_NAMES: &[&str] = &["check"];

/// Proof that the current request presented the admin password.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub is_password_set: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyView {
    pub name: String,
    pub masked_value: String,
    pub is_healthy: Option<bool>,
    pub usage: u64,
    pub errors: u64,
}

/// Authorizes an admin request from its `Authorization: Bearer <password>` header.
pub async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AdminSession, AdminError> {
    let password = extract_bearer(headers).ok_or(AdminError::MissingCredentials)?;
    check_password(state, password).await?;
    Ok(AdminSession {
        password: password.to_string(),
    })
}

pub async fn auth_status(state: &AppState) -> Result<AuthStatus, AdminError> {
    Ok(AuthStatus {
        is_password_set: state.store.load_admin_hash().await?.is_some(),
    })
}

pub async fn setup_password(state: &AppState, password: &str) -> Result<(), AdminError> {
    if !is_acceptable_password(password) {
        return Err(AdminError::BadRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }
    let _guard = state.admin_lock.lock().await;
    if state.store.load_admin_hash().await?.is_some() {
        return Err(AdminError::BadRequest("password already set".to_string()));
    }
    let hash = state.passwords.hash(password)?;
    state.store.save_admin_hash(&hash).await?;
    info!(event = "admin_password_set");
    Ok(())
}

pub async fn login(state: &AppState, password: &str) -> Result<(), AdminError> {
    check_password(state, password).await
}

pub async fn change_password(
    state: &AppState,
    _session: &AdminSession,
    current: &str,
    new: &str,
) -> Result<(), AdminError> {
    let _guard = state.admin_lock.lock().await;
    let stored = state
        .store
        .load_admin_hash()
        .await?
        .ok_or(AdminError::NotConfigured)?;
    if !state.passwords.verify(current, &stored).is_match() {
        return Err(AdminError::InvalidPassword);
    }
    if !is_acceptable_password(new) {
        return Err(AdminError::BadRequest(
            "new password must be at least 8 characters".to_string(),
        ));
    }
    if new == current {
        return Err(AdminError::BadRequest(
            "new password must differ from the current one".to_string(),
        ));
    }
    let hash = state.passwords.hash(new)?;
    state.store.save_admin_hash(&hash).await?;
    info!(event = "admin_password_changed");
    Ok(())
}

pub async fn list_keys(state: &AppState) -> Result<Vec<KeyView>, AdminError> {
    let keys = state.store.load_upstream_keys().await?;
    Ok(key_views(state, &keys))
}

pub async fn add_key(state: &AppState, name: &str, value: &str) -> Result<KeyView, AdminError> {
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        return Err(AdminError::BadRequest(
            "key name and value must not be empty".to_string(),
        ));
    }
    if RESERVED_KEY_NAMES.contains(&name) {
        return Err(AdminError::BadRequest(format!("key name \"{name}\" is reserved")));
    }
    if key_exists(state, name).await? {
        return Err(AdminError::Conflict("key name already exists".to_string()));
    }

    // The probe runs unlocked; the duplicate check is repeated under the lock.
    let mut key = UpstreamKey::new(name, value);
    let status = health::probe_key(state, &key).await;
    key.is_healthy = status.as_flag();

    let _guard = state.admin_lock.lock().await;
    let mut keys = state.store.load_upstream_keys().await?;
    if keys.iter().any(|k| k.name == name) {
        return Err(AdminError::Conflict("key name already exists".to_string()));
    }
    keys.push(key);
    state.store.save_upstream_keys(&keys).await?;
    state.health.mark(name, status);
    info!(event = "upstream_key_added", key = %name, healthy = ?status.as_flag());

    let added = &keys[keys.len() - 1];
    Ok(key_view(state, added, status))
}

pub async fn delete_key(state: &AppState, name: &str) -> Result<(), AdminError> {
    let _guard = state.admin_lock.lock().await;
    let mut keys = state.store.load_upstream_keys().await?;
    let idx = keys
        .iter()
        .position(|k| k.name == name)
        .ok_or_else(|| AdminError::NotFound("key not found".to_string()))?;
    keys.remove(idx);
    state.store.save_upstream_keys(&keys).await?;
    state.health.forget(name);
    state.stats.forget(name);
    info!(event = "upstream_key_deleted", key = %name);
    Ok(())
}

/// Probes every stored key now and returns the refreshed listing.
pub async fn check_keys(state: &AppState) -> Result<Vec<KeyView>, AdminError> {
    let keys = state.store.load_upstream_keys().await?;
    if !health::force_sweep(state, &keys).await {
        info!(event = "health_sweep_skipped", reason = "already running");
    }
    Ok(key_views(state, &keys))
}

pub async fn list_tokens(state: &AppState) -> Result<Vec<ClientToken>, AdminError> {
    Ok(state.store.load_client_tokens().await?)
}

pub async fn create_token(
    state: &AppState,
    name: &str,
    custom: Option<&str>,
) -> Result<ClientToken, AdminError> {
    let _guard = state.admin_lock.lock().await;
    let mut registry = TokenRegistry::new(state.store.load_client_tokens().await?);
    let created = registry.create(name, custom)?;
    state.store.save_client_tokens(registry.tokens()).await?;
    info!(event = "client_token_created", token_name = %created.name);
    Ok(created)
}

pub async fn set_token_enabled(
    state: &AppState,
    name: &str,
    enabled: bool,
) -> Result<ClientToken, AdminError> {
    let _guard = state.admin_lock.lock().await;
    let mut registry = TokenRegistry::new(state.store.load_client_tokens().await?);
    let updated = registry.set_enabled(name, enabled)?.clone();
    state.store.save_client_tokens(registry.tokens()).await?;
    info!(event = "client_token_updated", token_name = %name, enabled);
    Ok(updated)
}

pub async fn delete_token(state: &AppState, name: &str) -> Result<(), AdminError> {
    let _guard = state.admin_lock.lock().await;
    let mut registry = TokenRegistry::new(state.store.load_client_tokens().await?);
    registry.delete(name)?;
    state.store.save_client_tokens(registry.tokens()).await?;
    info!(event = "client_token_deleted", token_name = %name);
    Ok(())
}

async fn check_password(state: &AppState, password: &str) -> Result<(), AdminError> {
    let stored = state
        .store
        .load_admin_hash()
        .await?
        .ok_or(AdminError::NotConfigured)?;
    match state.passwords.verify(password, &stored) {
        Verification::Match => Ok(()),
        Verification::MatchLegacy => {
            upgrade_legacy_hash(state, password, &stored).await;
            Ok(())
        }
        Verification::Mismatch => {
            warn!(event = "admin_auth_failed");
            Err(AdminError::InvalidPassword)
        }
    }
}

/// Replaces an unsalted digest once the password behind it is known. Failure only logs.
async fn upgrade_legacy_hash(state: &AppState, password: &str, stored: &str) {
    let _guard = state.admin_lock.lock().await;
    // Someone may have changed the password while we waited.
    match state.store.load_admin_hash().await {
        Ok(Some(current)) if current == stored => {}
        Ok(_) => return,
        Err(err) => {
            warn!(event = "admin_hash_upgrade_failed", error = %err);
            return;
        }
    }
    let result = match state.passwords.hash(password) {
        Ok(hash) => state.store.save_admin_hash(&hash).await.map_err(AdminError::from),
        Err(err) => Err(err.into()),
    };
    match result {
        Ok(()) => info!(event = "admin_hash_upgraded"),
        Err(err) => warn!(event = "admin_hash_upgrade_failed", error = %err),
    }
}

async fn key_exists(state: &AppState, name: &str) -> Result<bool, AdminError> {
    let keys = state.store.load_upstream_keys().await?;
    Ok(keys.iter().any(|k| k.name == name))
}

fn key_views(state: &AppState, keys: &[UpstreamKey]) -> Vec<KeyView> {
    let statuses = state.key_health(keys);
    keys.iter()
        .zip(statuses)
        .map(|(key, status)| key_view(state, key, status))
        .collect()
}

fn key_view(state: &AppState, key: &UpstreamKey, status: HealthStatus) -> KeyView {
    let counters = state.stats.get(&key.name);
    KeyView {
        name: key.name.clone(),
        masked_value: key.masked_value(),
        is_healthy: status.as_flag(),
        usage: counters.usage,
        errors: counters.errors,
    }
}
