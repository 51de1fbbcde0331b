//! Per-profile key lifecycle and value encryption.
//!
//! Each profile owns one random AES-256 key kept in the secure store:
//! - `encryptionKey`: current key, created lazily on first use
//! - `encryptionKeyCreatedAt`: creation / last rotation time
//! - `encryptionKey_old`: previous key while data is still migrating
//! - `encryptionKey_new`: staging slot, only present mid-rotation
//!
//! Key creation, rotation and retirement for one profile are serialised by a
//! per-profile async mutex, so concurrent first use yields a single key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use zeroize::Zeroizing;

use super::envelope::Envelope;
use super::keys::ProfileKey;
use super::CryptoError;
use crate::config::{
    ENCRYPTION_KEY, ENCRYPTION_KEY_CREATED_AT, ENCRYPTION_KEY_NEW, ENCRYPTION_KEY_OLD,
};
use crate::keys::{KeyCodec, ProfileId};
use crate::store::SecureStore;

// ═══════════════════════════════════════════════════════════
// Clock
// ═══════════════════════════════════════════════════════════

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

// ═══════════════════════════════════════════════════════════
// KeyRing: loaded keys of one profile
// ═══════════════════════════════════════════════════════════

/// Current key plus, after a rotation, the key it replaced.
pub struct KeyRing {
    current: ProfileKey,
    current_id: String,
    previous: Option<(String, ProfileKey)>,
}

impl KeyRing {
    fn new(current: ProfileKey, previous: Option<ProfileKey>) -> Self {
        Self {
            current_id: current.key_id(),
            current,
            previous: previous.map(|key| (key.key_id(), key)),
        }
    }

    pub fn current(&self) -> &ProfileKey {
        &self.current
    }

    pub fn current_id(&self) -> &str {
        &self.current_id
    }

    pub fn previous_id(&self) -> Option<&str> {
        self.previous.as_ref().map(|(id, _)| id.as_str())
    }

    fn previous(&self) -> Option<&ProfileKey> {
        self.previous.as_ref().map(|(_, key)| key)
    }
}

/// Outcome of opening an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Decrypted {
    pub value: Value,
    /// Sealed with the key a rotation replaced; the caller should re-encrypt.
    pub under_previous_key: bool,
}

// ═══════════════════════════════════════════════════════════
// EncryptionEngine
// ═══════════════════════════════════════════════════════════

pub struct EncryptionEngine {
    secure: Arc<dyn SecureStore>,
    codec: KeyCodec,
    clock: Arc<dyn Clock>,
    rotation_window: Duration,
    rings: RwLock<HashMap<ProfileId, Arc<KeyRing>>>,
    locks: Mutex<HashMap<ProfileId, Arc<tokio::sync::Mutex<()>>>>,
}

impl EncryptionEngine {
    pub fn new(
        secure: Arc<dyn SecureStore>,
        codec: KeyCodec,
        clock: Arc<dyn Clock>,
        rotation_window: Duration,
    ) -> Self {
        Self {
            secure,
            codec,
            clock,
            rotation_window,
            rings: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, name: &str, profile: &ProfileId) -> Result<String, CryptoError> {
        Ok(self.codec.compose(name, profile)?)
    }

    fn profile_lock(&self, profile: &ProfileId) -> Result<Arc<tokio::sync::Mutex<()>>, CryptoError> {
        let mut locks = self.locks.lock().map_err(|_| CryptoError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(profile.clone()).or_default()))
    }

    fn cached(&self, profile: &ProfileId) -> Result<Option<Arc<KeyRing>>, CryptoError> {
        let rings = self.rings.read().map_err(|_| CryptoError::LockPoisoned)?;
        Ok(rings.get(profile).cloned())
    }

    fn cache(&self, profile: &ProfileId, ring: KeyRing) -> Result<Arc<KeyRing>, CryptoError> {
        let ring = Arc::new(ring);
        let mut rings = self.rings.write().map_err(|_| CryptoError::LockPoisoned)?;
        rings.insert(profile.clone(), Arc::clone(&ring));
        Ok(ring)
    }

    /// Drop the cached keys of `profile` (after a wipe).
    pub fn forget(&self, profile: &ProfileId) {
        if let Ok(mut rings) = self.rings.write() {
            rings.remove(profile);
        }
    }

    // ── Key lifecycle ───────────────────────────────────────

    /// Load the profile's keys, creating the key on first use.
    ///
    /// Concurrent callers for the same profile share one creation.
    pub async fn get_or_create_key(&self, profile: &ProfileId) -> Result<Arc<KeyRing>, CryptoError> {
        if let Some(ring) = self.cached(profile)? {
            return Ok(ring);
        }
        let lock = self.profile_lock(profile)?;
        let _guard = lock.lock().await;
        self.ring_locked(profile).await
    }

    /// Same as `get_or_create_key`; the profile lock must be held.
    async fn ring_locked(&self, profile: &ProfileId) -> Result<Arc<KeyRing>, CryptoError> {
        if let Some(ring) = self.cached(profile)? {
            return Ok(ring);
        }
        let ring = self.load_or_create(profile).await?;
        self.cache(profile, ring)
    }

    async fn load_or_create(&self, profile: &ProfileId) -> Result<KeyRing, CryptoError> {
        let current_slot = self.slot(ENCRYPTION_KEY, profile)?;
        let new_slot = self.slot(ENCRYPTION_KEY_NEW, profile)?;

        // A staged key means a rotation stopped before promotion; finish it.
        if let Some(staged) = self.secure.get(&new_slot).await? {
            let staged = Zeroizing::new(staged);
            ProfileKey::from_hex(&staged)?;
            self.secure.set(&current_slot, &staged).await?;
            self.secure.delete(&new_slot).await?;
            tracing::info!(profile_id = %profile, "Completed interrupted key rotation");
        }

        let current = match self.secure.get(&current_slot).await? {
            Some(encoded) => ProfileKey::from_hex(&Zeroizing::new(encoded))?,
            None => {
                let key = ProfileKey::generate();
                self.secure.set(&current_slot, &key.to_hex()).await?;
                self.secure
                    .set(
                        &self.slot(ENCRYPTION_KEY_CREATED_AT, profile)?,
                        &self.clock.now().to_rfc3339(),
                    )
                    .await?;
                tracing::info!(profile_id = %profile, key_id = %key.key_id(), "Encryption key created");
                key
            }
        };

        let previous = match self.secure.get(&self.slot(ENCRYPTION_KEY_OLD, profile)?).await? {
            Some(encoded) => Some(ProfileKey::from_hex(&Zeroizing::new(encoded))?),
            None => None,
        };

        Ok(KeyRing::new(current, previous))
    }

    // ── Encrypt / decrypt ───────────────────────────────────

    /// Serialize `value` to JSON and seal it under the profile's current key.
    pub async fn encrypt<T: Serialize + ?Sized>(
        &self,
        value: &T,
        profile: &ProfileId,
    ) -> Result<Envelope, CryptoError> {
        let ring = self.get_or_create_key(profile).await?;
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let mut envelope = ring.current().encrypt(&plaintext)?;
        envelope.key_id = Some(ring.current_id().to_string());
        Ok(envelope)
    }

    /// Decrypt `data`. Values that are not envelopes are legacy plaintext and
    /// come back unchanged.
    pub async fn decrypt(&self, data: &Value, profile: &ProfileId) -> Result<Value, CryptoError> {
        match Envelope::from_value(data) {
            Some(envelope) => Ok(self.open(&envelope, profile).await?.value),
            None => Ok(data.clone()),
        }
    }

    /// Decrypt an envelope, reporting which key generation opened it.
    pub async fn open(&self, envelope: &Envelope, profile: &ProfileId) -> Result<Decrypted, CryptoError> {
        let ring = self.get_or_create_key(profile).await?;

        let mut candidates: Vec<(&ProfileKey, bool)> = Vec::with_capacity(2);
        match envelope.key_id.as_deref() {
            Some(id) if id == ring.current_id() => candidates.push((ring.current(), false)),
            Some(id) if Some(id) == ring.previous_id() => {
                if let Some(previous) = ring.previous() {
                    candidates.push((previous, true));
                }
            }
            Some(id) => return Err(CryptoError::UnknownKey(id.to_string())),
            None => {
                candidates.push((ring.current(), false));
                if let Some(previous) = ring.previous() {
                    candidates.push((previous, true));
                }
            }
        }

        if envelope.key_id.is_none() {
            tracing::debug!(profile_id = %profile, "Opening envelope without key id");
        }

        // A wrong key passes the padding check now and then. With two
        // candidates, a JSON plaintext wins over a bare string.
        let strict = candidates.len() > 1;
        let opened: Vec<(Zeroizing<Vec<u8>>, bool)> = candidates
            .into_iter()
            .filter_map(|(key, under_previous_key)| {
                key.decrypt(envelope)
                    .ok()
                    .map(|plaintext| (Zeroizing::new(plaintext), under_previous_key))
            })
            .collect();

        if strict {
            for (plaintext, under_previous_key) in &opened {
                if let Ok(value) = serde_json::from_slice::<Value>(plaintext) {
                    return Ok(Decrypted {
                        value,
                        under_previous_key: *under_previous_key,
                    });
                }
            }
        }
        for (plaintext, under_previous_key) in &opened {
            if let Some(value) = decode_plaintext(plaintext) {
                return Ok(Decrypted {
                    value,
                    under_previous_key: *under_previous_key,
                });
            }
        }
        Err(CryptoError::DecryptionFailed)
    }

    /// Whether a replaced key is still kept for `profile`. Never creates a key.
    pub async fn holds_previous_key(&self, profile: &ProfileId) -> Result<bool, CryptoError> {
        if let Some(ring) = self.cached(profile)? {
            return Ok(ring.previous_id().is_some());
        }
        Ok(self
            .secure
            .get(&self.slot(ENCRYPTION_KEY_OLD, profile)?)
            .await?
            .is_some())
    }

    // ── Rotation ────────────────────────────────────────────

    async fn created_at(&self, profile: &ProfileId) -> Result<Option<DateTime<Utc>>, CryptoError> {
        let raw = self
            .secure
            .get(&self.slot(ENCRYPTION_KEY_CREATED_AT, profile)?)
            .await?;
        Ok(raw.and_then(|raw| {
            let parsed = parse_timestamp(&raw);
            if parsed.is_none() {
                tracing::warn!(profile_id = %profile, "Unreadable key creation timestamp");
            }
            parsed
        }))
    }

    /// Whether the profile's key is at least `rotation_window` old.
    /// A profile without a creation timestamp is never due.
    pub async fn should_rotate(&self, profile: &ProfileId) -> Result<bool, CryptoError> {
        Ok(match self.created_at(profile).await? {
            Some(created) => self.clock.now() - created >= self.rotation_window,
            None => false,
        })
    }

    /// Replace the profile's key if it is due. Returns whether a rotation ran.
    ///
    /// The replaced key stays readable as the previous key until
    /// `retire_previous_key`. While a previous key is still held, further
    /// rotations are deferred so at most two generations exist.
    pub async fn rotate(&self, profile: &ProfileId) -> Result<bool, CryptoError> {
        let lock = self.profile_lock(profile)?;
        let _guard = lock.lock().await;

        if !self.should_rotate(profile).await? {
            return Ok(false);
        }
        let ring = self.ring_locked(profile).await?;
        if ring.previous_id().is_some() {
            tracing::info!(profile_id = %profile, "Rotation deferred until previous key is retired");
            return Ok(false);
        }

        let old = ring.current().duplicate();
        let new = ProfileKey::generate();
        let current_slot = self.slot(ENCRYPTION_KEY, profile)?;
        let new_slot = self.slot(ENCRYPTION_KEY_NEW, profile)?;

        // Phase 1: stage both keys next to the live one.
        self.secure
            .set(&self.slot(ENCRYPTION_KEY_OLD, profile)?, &old.to_hex())
            .await?;
        self.secure.set(&new_slot, &new.to_hex()).await?;
        self.secure
            .set(
                &self.slot(ENCRYPTION_KEY_CREATED_AT, profile)?,
                &self.clock.now().to_rfc3339(),
            )
            .await?;

        // Phase 2: promote.
        self.secure.set(&current_slot, &new.to_hex()).await?;
        self.secure.delete(&new_slot).await?;

        tracing::info!(
            profile_id = %profile,
            old_key_id = %old.key_id(),
            new_key_id = %new.key_id(),
            "Encryption key rotated"
        );
        self.cache(profile, KeyRing::new(new, Some(old)))?;
        Ok(true)
    }

    /// Forget the key a rotation replaced. Data still sealed with it becomes
    /// unreadable, so callers migrate first.
    pub async fn retire_previous_key(&self, profile: &ProfileId) -> Result<(), CryptoError> {
        let lock = self.profile_lock(profile)?;
        let _guard = lock.lock().await;

        let ring = self.ring_locked(profile).await?;
        self.secure
            .delete(&self.slot(ENCRYPTION_KEY_OLD, profile)?)
            .await?;
        if let Some(old_id) = ring.previous_id() {
            tracing::info!(profile_id = %profile, key_id = %old_id, "Previous encryption key retired");
            self.cache(profile, KeyRing::new(ring.current().duplicate(), None))?;
        }
        Ok(())
    }
}

/// JSON first; a plaintext from older builds may be a bare string.
fn decode_plaintext(plaintext: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice(plaintext) {
        return Some(value);
    }
    std::str::from_utf8(plaintext)
        .ok()
        .map(|s| Value::String(s.to_string()))
}

/// RFC 3339, or epoch milliseconds as written by older builds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
