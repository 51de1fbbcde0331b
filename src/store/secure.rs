//! Secure-item store selection.
//!
//! Secure items live in the OS keyring (macOS/iOS Keychain, Windows
//! Credential Manager, Linux kernel keyutils). Platforms without one keep
//! them in the plain key-value store under a reserved prefix. Callers see
//! the same contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{KvStore, MemorySecureStore, SecureStore, StoreError};
use crate::config::APP_NAME;

/// Reserved prefix for secure items kept in the plain store.
pub const SECURE_FALLBACK_PREFIX: &str = "secure__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureBackend {
    /// OS keyring, one credential per secure item.
    Keyring,
    /// Process-local only (tests, ephemeral sessions).
    InMemory,
    /// Plain key-value store under `SECURE_FALLBACK_PREFIX`.
    KvFallback,
}

impl SecureBackend {
    /// The OS keyring where the platform has one, the plain store elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "windows",
            target_os = "linux"
        )) {
            Self::Keyring
        } else {
            Self::KvFallback
        }
    }
}

/// Secure store backed by the OS keyring.
///
/// Each item is a credential with service `service` and the composite key as
/// user. Keyring calls block, so they run on the blocking pool.
pub struct KeyringSecureStore {
    service: String,
}

impl KeyringSecureStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&keyring::Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            op(&entry).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let value = zeroize::Zeroizing::new(value.to_string());
        self.with_entry(key, move |entry| entry.set_password(&value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }
}

/// Secure store layered over a plain `KvStore`.
pub struct KvSecureStore {
    kv: Arc<dyn KvStore>,
}

impl KvSecureStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn slot(key: &str) -> String {
        format!("{SECURE_FALLBACK_PREFIX}{key}")
    }
}

#[async_trait]
impl SecureStore for KvSecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.kv.get(&Self::slot(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.kv.set(&Self::slot(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.kv.remove(&Self::slot(key)).await
    }
}

/// Build the secure store for `backend`.
pub fn secure_store_for(backend: SecureBackend, kv: Arc<dyn KvStore>) -> Arc<dyn SecureStore> {
    match backend {
        SecureBackend::Keyring => Arc::new(KeyringSecureStore::new(APP_NAME)),
        SecureBackend::InMemory => Arc::new(MemorySecureStore::new()),
        SecureBackend::KvFallback => {
            tracing::info!("No secure enclave backend configured, secure items use the key-value store");
            Arc::new(KvSecureStore::new(kv))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[tokio::test]
    async fn fallback_items_are_prefixed_in_plain_store() {
        let kv = Arc::new(MemoryKvStore::new());
        let secure = KvSecureStore::new(kv.clone());

        secure.set("pv_p1_authToken", "tok").await.unwrap();

        assert!(kv.get("pv_p1_authToken").await.unwrap().is_none());
        assert_eq!(
            kv.get("secure__pv_p1_authToken").await.unwrap().as_deref(),
            Some("tok")
        );
        assert_eq!(
            secure.get("pv_p1_authToken").await.unwrap().as_deref(),
            Some("tok")
        );
    }

    #[tokio::test]
    async fn both_backends_behave_identically() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        for backend in [SecureBackend::InMemory, SecureBackend::KvFallback] {
            let secure = secure_store_for(backend, kv.clone());
            assert!(secure.get("pin").await.unwrap().is_none());
            secure.set("pin", "1234").await.unwrap();
            assert_eq!(secure.get("pin").await.unwrap().as_deref(), Some("1234"));
            secure.delete("pin").await.unwrap();
            secure.delete("pin").await.unwrap();
            assert!(secure.get("pin").await.unwrap().is_none());
        }
    }

    #[test]
    fn keyring_is_the_default_where_the_os_has_one() {
        let expected = if cfg!(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "windows"
        )) {
            SecureBackend::Keyring
        } else {
            SecureBackend::KvFallback
        };
        assert_eq!(SecureBackend::platform_default(), expected);
    }

    #[test]
    fn backend_names_round_trip_through_config_files() {
        let raw = serde_json::to_string(&SecureBackend::KvFallback).unwrap();
        assert_eq!(raw, "\"kv_fallback\"");
        let parsed: SecureBackend = serde_json::from_str("\"keyring\"").unwrap();
        assert_eq!(parsed, SecureBackend::Keyring);
    }

    #[tokio::test]
    #[ignore = "needs an unlocked OS keyring"]
    async fn keyring_store_round_trip() {
        let secure = KeyringSecureStore::new(format!("{APP_NAME}-test"));
        let key = format!("pv_{}_profilePin", uuid::Uuid::new_v4());

        assert!(secure.get(&key).await.unwrap().is_none());
        secure.set(&key, "1234").await.unwrap();
        assert_eq!(secure.get(&key).await.unwrap().as_deref(), Some("1234"));
        secure.delete(&key).await.unwrap();
        secure.delete(&key).await.unwrap();
        assert!(secure.get(&key).await.unwrap().is_none());
    }
}
