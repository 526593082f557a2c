use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, Schema,
};
use time::OffsetDateTime;

use crate::entities;
use crate::storage::{KvStore, StorageResult};

#[derive(Clone)]
pub struct SeaOrmKvStore {
    db: DatabaseConnection,
}

impl SeaOrmKvStore {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let mut options = ConnectOptions::new(dsn.to_string());
        options.sqlx_logging(false);
        // Every pooled connection to `:memory:` would otherwise see its own database.
        if dsn.contains(":memory:") {
            options.max_connections(1).min_connections(1);
        }
        let db = Database::connect(options).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl KvStore for SeaOrmKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let row = entities::KvEntries::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|m| m.value))
    }

    async fn put(&self, key: &str, value: String) -> StorageResult<()> {
        use entities::kv_entries::ActiveModel as KvActive;

        let now = OffsetDateTime::now_utc();
        let existing = entities::KvEntries::find_by_id(key.to_string())
            .one(&self.db)
            .await?;

        match existing {
            Some(model) => {
                let mut active: KvActive = model.into();
                active.value = ActiveValue::Set(value);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = KvActive {
                    name: ActiveValue::Set(key.to_string()),
                    value: ActiveValue::Set(value),
                    updated_at: ActiveValue::Set(now),
                };
                entities::KvEntries::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    /// Entity-first schema sync (SeaORM 2.0).
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::KvEntries)
            .sync(&self.db)
            .await?;
        Ok(())
    }
}
