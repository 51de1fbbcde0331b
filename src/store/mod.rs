//! Backing stores.
//!
//! Two flat async contracts sit under the facade:
//! - `KvStore`: the plain key-value store (any persistent string store)
//! - `SecureStore`: OS keystore-backed secure items
//!
//! Both are process-wide singletons shared behind `Arc<dyn ...>`.

pub mod memory;
pub mod secure;
pub mod sqlite;

pub use memory::{MemoryKvStore, MemorySecureStore};
pub use secure::{secure_store_for, KeyringSecureStore, KvSecureStore, SecureBackend};
pub use sqlite::SqliteKvStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Background store task failed: {0}")]
    Task(String),
}

/// Plain key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn get_all_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Secure-item store (OS keystore / secure enclave).
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deleting a missing item is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
