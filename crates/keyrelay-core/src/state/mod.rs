use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use keyrelay_common::GlobalConfig;
use keyrelay_provider_core::{HealthBoard, HealthStatus, KeyStats, RotationCursor};
use keyrelay_storage::{CredentialStore, KvStore, UpstreamKey};

use crate::password::{PasswordError, PasswordHashing};
use crate::upstream_client::UpstreamClient;

/// Process-wide handles. Keys, tokens and the admin hash are not cached here;
/// every request reloads them through `store`.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub store: CredentialStore,
    pub passwords: PasswordHashing,
    pub health: HealthBoard,
    pub cursor: RotationCursor,
    pub stats: KeyStats,
    pub upstream: Arc<dyn UpstreamClient>,
    /// Serializes admin load-modify-save sequences within this process.
    pub admin_lock: Mutex<()>,
}

impl AppState {
    pub fn new(
        global: GlobalConfig,
        kv: Arc<dyn KvStore>,
        upstream: Arc<dyn UpstreamClient>,
        cursor: usize,
    ) -> Result<Self, PasswordError> {
        let passwords = PasswordHashing::new(global.password_cost)?;
        let interval = Duration::from_secs(global.health_check_interval_secs);
        Ok(Self {
            global: ArcSwap::from_pointee(global),
            store: CredentialStore::new(kv),
            passwords,
            health: HealthBoard::new(interval),
            cursor: RotationCursor::new(cursor),
            stats: KeyStats::new(),
            upstream,
            admin_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> Arc<GlobalConfig> {
        self.global.load_full()
    }

    /// Live status per key, seeding the board from persisted flags on first sight.
    pub fn key_health(&self, keys: &[UpstreamKey]) -> Vec<HealthStatus> {
        for key in keys {
            self.health
                .seed(&key.name, HealthStatus::from_flag(key.is_healthy));
        }
        self.health.statuses(keys.iter().map(|k| k.name.as_str()))
    }
}
