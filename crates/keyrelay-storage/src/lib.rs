pub mod credentials;
pub mod entities;
pub mod memory;
pub mod records;
pub mod seaorm;
pub mod storage;

pub use credentials::{CredentialSnapshot, CredentialStore};
pub use memory::MemoryKvStore;
pub use records::{ClientToken, UpstreamKey};
pub use seaorm::SeaOrmKvStore;
pub use storage::{KvStore, StorageError, StorageResult, connect_kv};
