//! Profile storage facade.
//!
//! Routes every read and write through the key codec. Values under sensitive
//! logical keys are sealed by the encryption engine; everything else is stored
//! verbatim. Secure items (tokens, PINs, key material) go to the secure store
//! under the same namespacing.
//!
//! Failure policy:
//! - encryption failure on write: value is stored unencrypted and logged
//! - decryption failure on read: surfaced to the caller
//! - non-envelope value under a sensitive key: returned unchanged (legacy data)
//!
//! Sensitive writes, migration rewrites and previous-key retirement for one
//! profile run under a per-profile write lock. A migration rewrite only lands
//! if the stored value is still the one that was read.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{self, StorageConfig, PROFILE_SECURE_ITEMS, SENSITIVE_KEYS};
use crate::crypto::{Clock, CryptoError, EncryptionEngine, Envelope, SystemClock};
use crate::keys::{KeyCodec, KeyError, ProfileId};
use crate::store::{
    secure_store_for, KvStore, MemoryKvStore, SecureBackend, SecureStore, SqliteKvStore,
    StoreError,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid storage key: {0}")]
    Key(#[from] KeyError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WipeReport {
    pub keys_removed: usize,
    pub secure_items_removed: usize,
}

pub struct ProfileStorage {
    kv: Arc<dyn KvStore>,
    secure: Arc<dyn SecureStore>,
    engine: Arc<EncryptionEngine>,
    codec: KeyCodec,
    background_rotation: bool,
    write_locks: Mutex<HashMap<ProfileId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProfileStorage {
    pub fn new(
        kv: Arc<dyn KvStore>,
        secure: Arc<dyn SecureStore>,
        config: &StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let codec = KeyCodec::new(config.key_prefix.clone(), config.key_scheme);
        let engine = Arc::new(EncryptionEngine::new(
            Arc::clone(&secure),
            codec.clone(),
            clock,
            config.rotation_window,
        ));
        Self {
            kv,
            secure,
            engine,
            codec,
            background_rotation: config.background_rotation,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persistent storage in the SQLite database at `path`.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self, StorageError> {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(path)?);
        let secure = secure_store_for(config.secure_backend, Arc::clone(&kv));
        tracing::info!(path = %path.display(), "Profile storage opened");
        Ok(Self::new(kv, secure, config, Arc::new(SystemClock)))
    }

    /// Process-local storage (tests, guest sessions). Secure items stay in
    /// the process too, even when the config names the OS keyring.
    pub fn in_memory(config: &StorageConfig) -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let backend = match config.secure_backend {
            SecureBackend::Keyring => SecureBackend::InMemory,
            other => other,
        };
        let secure = secure_store_for(backend, Arc::clone(&kv));
        Self::new(kv, secure, config, Arc::new(SystemClock))
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn engine(&self) -> &Arc<EncryptionEngine> {
        &self.engine
    }

    /// Underlying plain store (for bookkeeping outside profile namespaces).
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn write_lock(&self, profile: &ProfileId) -> Result<Arc<tokio::sync::Mutex<()>>, StorageError> {
        let mut locks = self.write_locks.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(profile.clone()).or_default()))
    }

    // ── Plain items ─────────────────────────────────────────

    pub async fn get_item(
        &self,
        profile: &ProfileId,
        logical_key: &str,
    ) -> Result<Option<String>, StorageError> {
        let storage_key = self.codec.compose(logical_key, profile)?;
        let Some(raw) = self.kv.get(&storage_key).await? else {
            return Ok(None);
        };
        if !config::is_sensitive(logical_key) {
            return Ok(Some(raw));
        }

        let Some(envelope) = Envelope::parse(&raw) else {
            tracing::debug!(profile_id = %profile, key = logical_key, "Unencrypted legacy value returned as-is");
            return Ok(Some(raw));
        };

        let decrypted = self.engine.open(&envelope, profile).await?;
        if decrypted.under_previous_key {
            self.reencrypt(profile, logical_key, &storage_key, &raw, &decrypted.value)
                .await;
        }
        self.retire_check(profile).await;
        Ok(Some(value_to_string(decrypted.value)))
    }

    /// Empty values are ignored.
    pub async fn set_item(
        &self,
        profile: &ProfileId,
        logical_key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        if value.is_empty() {
            tracing::debug!(profile_id = %profile, key = logical_key, "Ignoring empty value");
            return Ok(());
        }
        let storage_key = self.codec.compose(logical_key, profile)?;
        if !config::is_sensitive(logical_key) {
            self.kv.set(&storage_key, value).await?;
            return Ok(());
        }

        self.spawn_rotation_check(profile);

        {
            let lock = self.write_lock(profile)?;
            let _guard = lock.lock().await;
            match self.seal(profile, value).await {
                Ok(json) => self.kv.set(&storage_key, &json).await?,
                Err(err) => {
                    self.write_unencrypted_fallback(profile, logical_key, &storage_key, value, &err)
                        .await?
                }
            }
        }
        self.retire_check(profile).await;
        Ok(())
    }

    pub async fn remove_item(&self, profile: &ProfileId, logical_key: &str) -> Result<(), StorageError> {
        let storage_key = self.codec.compose(logical_key, profile)?;
        if !config::is_sensitive(logical_key) {
            self.kv.remove(&storage_key).await?;
            return Ok(());
        }
        {
            let lock = self.write_lock(profile)?;
            let _guard = lock.lock().await;
            self.kv.remove(&storage_key).await?;
        }
        self.retire_check(profile).await;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        profile: &ProfileId,
        logical_key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get_item(profile, logical_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        profile: &ProfileId,
        logical_key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.set_item(profile, logical_key, &raw).await
    }

    async fn seal(&self, profile: &ProfileId, value: &str) -> Result<String, CryptoError> {
        self.engine.encrypt(value, profile).await?.to_json()
    }

    /// Availability over confidentiality: keep the write even when it cannot
    /// be encrypted.
    async fn write_unencrypted_fallback(
        &self,
        profile: &ProfileId,
        logical_key: &str,
        storage_key: &str,
        value: &str,
        cause: &CryptoError,
    ) -> Result<(), StorageError> {
        tracing::warn!(
            profile_id = %profile,
            key = logical_key,
            error = %cause,
            "Encryption failed, storing value unencrypted"
        );
        self.kv.set(storage_key, value).await?;
        Ok(())
    }

    fn spawn_rotation_check(&self, profile: &ProfileId) {
        if !self.background_rotation {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        let profile = profile.clone();
        runtime.spawn(async move {
            if let Err(e) = engine.rotate(&profile).await {
                tracing::warn!(profile_id = %profile, "Background key rotation failed: {e}");
            }
        });
    }

    // ── Incremental re-encryption ───────────────────────────

    /// Rewrite an item read under the previous key with the current key.
    /// Failures leave the old envelope in place; it stays readable.
    async fn reencrypt(
        &self,
        profile: &ProfileId,
        logical_key: &str,
        storage_key: &str,
        read: &str,
        value: &Value,
    ) {
        let result = async {
            let lock = self.write_lock(profile)?;
            let _guard = lock.lock().await;
            self.rewrite_if_unchanged(profile, storage_key, read, value).await
        }
        .await;
        match result {
            Ok(true) => tracing::debug!(profile_id = %profile, key = logical_key, "Re-encrypted under current key"),
            Ok(false) => tracing::debug!(profile_id = %profile, key = logical_key, "Item changed since read, re-encryption skipped"),
            Err(e) => tracing::warn!(profile_id = %profile, key = logical_key, "Re-encryption failed: {e}"),
        }
    }

    /// Seal `value` under the current key unless the stored item is no longer
    /// `read`. The profile write lock must be held.
    async fn rewrite_if_unchanged(
        &self,
        profile: &ProfileId,
        storage_key: &str,
        read: &str,
        value: &Value,
    ) -> Result<bool, StorageError> {
        if self.kv.get(storage_key).await?.as_deref() != Some(read) {
            return Ok(false);
        }
        let json = self.engine.encrypt(value, profile).await?.to_json()?;
        self.kv.set(storage_key, &json).await?;
        Ok(true)
    }

    /// Retire the previous key once nothing needs it. Never fails the caller.
    async fn retire_check(&self, profile: &ProfileId) {
        if let Err(e) = self.retire_previous_if_migrated(profile).await {
            tracing::warn!(profile_id = %profile, "Previous key retirement check failed: {e}");
        }
    }

    /// Whether the item at `storage_key` still needs the previous key.
    async fn needs_previous_key(
        &self,
        profile: &ProfileId,
        storage_key: &str,
        previous_id: &str,
    ) -> Result<bool, StorageError> {
        let Some(raw) = self.kv.get(storage_key).await? else {
            return Ok(false);
        };
        let Some(envelope) = Envelope::parse(&raw) else {
            return Ok(false);
        };
        Ok(match envelope.key_id.as_deref() {
            Some(id) => id == previous_id,
            None => matches!(
                self.engine.open(&envelope, profile).await,
                Ok(decrypted) if decrypted.under_previous_key
            ),
        })
    }

    async fn retire_previous_if_migrated(&self, profile: &ProfileId) -> Result<bool, StorageError> {
        if !self.engine.holds_previous_key(profile).await? {
            return Ok(false);
        }
        let lock = self.write_lock(profile)?;
        let _guard = lock.lock().await;
        let ring = self.engine.get_or_create_key(profile).await?;
        let Some(previous_id) = ring.previous_id() else {
            return Ok(false);
        };
        for logical_key in SENSITIVE_KEYS {
            let storage_key = self.codec.compose(logical_key, profile)?;
            if self.needs_previous_key(profile, &storage_key, previous_id).await? {
                return Ok(false);
            }
        }
        self.engine.retire_previous_key(profile).await?;
        Ok(true)
    }

    /// Re-encrypt every sensitive item still sealed with the previous key,
    /// then retire that key. Returns the number of items migrated.
    pub async fn complete_rotation(&self, profile: &ProfileId) -> Result<usize, StorageError> {
        if !self.engine.holds_previous_key(profile).await? {
            return Ok(0);
        }
        let lock = self.write_lock(profile)?;
        let _guard = lock.lock().await;

        let mut migrated = 0;
        for logical_key in SENSITIVE_KEYS {
            let storage_key = self.codec.compose(logical_key, profile)?;
            let Some(raw) = self.kv.get(&storage_key).await? else {
                continue;
            };
            let Some(envelope) = Envelope::parse(&raw) else {
                continue;
            };
            match self.engine.open(&envelope, profile).await {
                Ok(decrypted) if decrypted.under_previous_key => {
                    if self
                        .rewrite_if_unchanged(profile, &storage_key, &raw, &decrypted.value)
                        .await?
                    {
                        migrated += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(profile_id = %profile, key = logical_key, "Unreadable item skipped during key migration: {e}");
                }
            }
        }

        self.engine.retire_previous_key(profile).await?;
        tracing::info!(profile_id = %profile, migrated, "Key rotation completed");
        Ok(migrated)
    }

    // ── Secure items ────────────────────────────────────────

    /// Empty values are ignored.
    pub async fn set_secure_item(
        &self,
        profile: &ProfileId,
        logical_key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        if value.is_empty() {
            return Ok(());
        }
        let slot = self.codec.compose(logical_key, profile)?;
        self.secure.set(&slot, value).await?;
        Ok(())
    }

    pub async fn get_secure_item(
        &self,
        profile: &ProfileId,
        logical_key: &str,
    ) -> Result<Option<String>, StorageError> {
        let slot = self.codec.compose(logical_key, profile)?;
        Ok(self.secure.get(&slot).await?)
    }

    pub async fn remove_secure_item(&self, profile: &ProfileId, logical_key: &str) -> Result<(), StorageError> {
        let slot = self.codec.compose(logical_key, profile)?;
        self.secure.delete(&slot).await?;
        Ok(())
    }

    // ── Wipe ────────────────────────────────────────────────

    /// Delete every key in the profile's namespace plus its secure items.
    /// Idempotent; not atomic across keys.
    pub async fn wipe_profile(&self, profile: &ProfileId) -> Result<WipeReport, StorageError> {
        let namespace = self.codec.profile_namespace(profile);
        let keys: Vec<String> = self
            .kv
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&namespace))
            .collect();
        self.kv.multi_remove(&keys).await?;

        let mut secure_items_removed = 0;
        for name in PROFILE_SECURE_ITEMS {
            let slot = self.codec.compose(name, profile)?;
            if self.secure.get(&slot).await?.is_some() {
                self.secure.delete(&slot).await?;
                secure_items_removed += 1;
            }
        }
        self.engine.forget(profile);

        let report = WipeReport {
            keys_removed: keys.len(),
            secure_items_removed,
        };
        tracing::info!(
            profile_id = %profile,
            keys = report.keys_removed,
            secure_items = report.secure_items_removed,
            "Profile storage wiped"
        );
        Ok(report)
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
