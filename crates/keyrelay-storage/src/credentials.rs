use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::records::{ClientToken, UpstreamKey};
use crate::storage::{KvStore, StorageError, StorageResult};

pub const API_KEYS: &str = "api_keys";
pub const CLIENT_TOKENS: &str = "client_tokens";
pub const ADMIN_PASSWORD_HASH: &str = "admin_password_hash";
pub const CURRENT_KEY_INDEX: &str = "current_key_index";

/// Everything a request needs, read fresh from the store.
#[derive(Debug, Clone, Default)]
pub struct CredentialSnapshot {
    pub upstream_keys: Vec<UpstreamKey>,
    pub client_tokens: Vec<ClientToken>,
    pub admin_hash: Option<String>,
}

/// Typed view over the flat KV layout. Each save is a single `put`.
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn load_all(&self) -> StorageResult<CredentialSnapshot> {
        let (upstream_keys, client_tokens, admin_hash) = tokio::try_join!(
            self.load_upstream_keys(),
            self.load_client_tokens(),
            self.load_admin_hash(),
        )?;
        Ok(CredentialSnapshot {
            upstream_keys,
            client_tokens,
            admin_hash,
        })
    }

    pub async fn load_upstream_keys(&self) -> StorageResult<Vec<UpstreamKey>> {
        self.load_list(API_KEYS).await
    }

    pub async fn load_client_tokens(&self) -> StorageResult<Vec<ClientToken>> {
        self.load_list(CLIENT_TOKENS).await
    }

    pub async fn load_admin_hash(&self) -> StorageResult<Option<String>> {
        let raw = self.kv.get(ADMIN_PASSWORD_HASH).await?;
        Ok(raw
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    pub async fn save_upstream_keys(&self, keys: &[UpstreamKey]) -> StorageResult<()> {
        self.save_json(API_KEYS, &keys).await
    }

    pub async fn save_client_tokens(&self, tokens: &[ClientToken]) -> StorageResult<()> {
        self.save_json(CLIENT_TOKENS, &tokens).await
    }

    pub async fn save_admin_hash(&self, hash: &str) -> StorageResult<()> {
        self.kv.put(ADMIN_PASSWORD_HASH, hash.to_string()).await
    }

    pub async fn load_cursor(&self) -> StorageResult<usize> {
        let Some(raw) = self.kv.get(CURRENT_KEY_INDEX).await? else {
            return Ok(0);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(0);
        }
        raw.parse::<usize>()
            .map_err(|err| StorageError::InvalidValue {
                key: CURRENT_KEY_INDEX,
                message: err.to_string(),
            })
    }

    pub async fn save_cursor(&self, cursor: usize) -> StorageResult<()> {
        self.kv.put(CURRENT_KEY_INDEX, cursor.to_string()).await
    }

    async fn load_list<T: DeserializeOwned>(&self, key: &'static str) -> StorageResult<Vec<T>> {
        match self.kv.get(key).await? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.put(key, raw).await
    }
}
