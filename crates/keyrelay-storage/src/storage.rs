use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::ConnectionTrait;

use crate::memory::MemoryKvStore;
use crate::seaorm::SeaOrmKvStore;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Flat string store: atomic per key, no cross-key transactions.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    async fn put(&self, key: &str, value: String) -> StorageResult<()>;

    /// Prepare backing schema. No-op for stores without one.
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// `memory://` gives a process-local store; anything else goes to SeaORM.
pub async fn connect_kv(dsn: &str) -> StorageResult<Arc<dyn KvStore>> {
    if dsn.trim().eq_ignore_ascii_case("memory://") || dsn.trim().eq_ignore_ascii_case("memory") {
        tracing::warn!(event = "storage_connected", backend = "memory", "state is not persisted");
        return Ok(Arc::new(MemoryKvStore::new()));
    }
    let store = SeaOrmKvStore::connect(dsn).await?;
    store.sync().await?;
    tracing::info!(
        event = "storage_connected",
        backend = ?store.connection().get_database_backend(),
        "storage ready"
    );
    Ok(Arc::new(store))
}
