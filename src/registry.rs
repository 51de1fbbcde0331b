//! Profile registry: the family's list of profiles, the last active profile,
//! and one-time migration of pre-namespacing data.
//!
//! Bookkeeping lives under global keys (outside every profile namespace):
//! - `<prefix>__registry_profiles`: JSON list of `ProfileInfo`
//! - `<prefix>__registry_active`: id of the last active profile
//! - `<prefix>__legacy_migrated`: id of the profile that received legacy data
//!
//! Values found under the older `<prefix>_<name>` keys move on first read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::LEGACY_KEYS;
use crate::keys::{KeyError, ProfileId};
use crate::session::SessionContext;
use crate::storage::{ProfileStorage, StorageError, WipeReport};
use crate::store::StoreError;

const PROFILES_KEY: &str = "registry_profiles";
const ACTIVE_KEY: &str = "registry_active";
const LEGACY_MARKER_KEY: &str = "legacy_migrated";

/// 8-color palette for profile visual identity.
pub const PROFILE_COLORS: [&str; 8] = [
    "#4A90D9", // Blue
    "#E07C4F", // Coral
    "#5BAE6E", // Green
    "#9B6DC6", // Purple
    "#D4A843", // Gold
    "#E06B8C", // Rose
    "#47A5A5", // Teal
    "#8B7355", // Warm brown
];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Profile not found: {0}")]
    ProfileNotFound(ProfileId),

    #[error("Profile already exists: {0}")]
    ProfileExists(String),

    #[error("Profile name must not be empty")]
    EmptyName,

    #[error("Corrupted profile registry: {0}")]
    Corrupted(#[from] serde_json::Error),

    #[error("Invalid profile id: {0}")]
    Key(#[from] KeyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Profile metadata (stored unencrypted, names are visible by design)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInfo {
    pub id: ProfileId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Who manages this profile (e.g. a parent for a child's profile).
    #[serde(default)]
    pub managed_by: Option<String>,
    #[serde(default)]
    pub color_index: Option<u8>,
}

pub struct ProfileRegistry {
    storage: Arc<ProfileStorage>,
    /// Serialises read-modify-write cycles on the profile list.
    write_lock: tokio::sync::Mutex<()>,
}

impl ProfileRegistry {
    pub fn new(storage: Arc<ProfileStorage>) -> Self {
        Self {
            storage,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<ProfileStorage> {
        &self.storage
    }

    fn global_key(&self, name: &str) -> String {
        self.storage.codec().global_key(name)
    }

    async fn read_global(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let kv = self.storage.kv();
        let key = self.global_key(name);
        if let Some(value) = kv.get(&key).await? {
            return Ok(Some(value));
        }
        let older = self.storage.codec().single_separator_global_key(name);
        let Some(value) = kv.get(&older).await? else {
            return Ok(None);
        };
        kv.set(&key, &value).await?;
        kv.remove(&older).await?;
        tracing::info!(key = name, "Registry entry moved to its global key");
        Ok(Some(value))
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileInfo>, RegistryError> {
        match self.read_global(PROFILES_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_profiles(&self, profiles: &[ProfileInfo]) -> Result<(), RegistryError> {
        let raw = serde_json::to_string(profiles)?;
        self.storage
            .kv()
            .set(&self.global_key(PROFILES_KEY), &raw)
            .await?;
        Ok(())
    }

    pub async fn get_profile(&self, id: &ProfileId) -> Result<Option<ProfileInfo>, RegistryError> {
        Ok(self
            .list_profiles()
            .await?
            .into_iter()
            .find(|p| &p.id == id))
    }

    pub async fn create_profile(
        &self,
        name: &str,
        managed_by: Option<&str>,
    ) -> Result<ProfileInfo, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let _guard = self.write_lock.lock().await;
        let mut profiles = self.list_profiles().await?;
        if profiles.iter().any(|p| p.name == name) {
            return Err(RegistryError::ProfileExists(name.to_string()));
        }

        let info = ProfileInfo {
            id: ProfileId::new(Uuid::new_v4().to_string())?,
            name: name.to_string(),
            created_at: Utc::now(),
            managed_by: managed_by.map(str::to_string),
            color_index: Some((profiles.len() % PROFILE_COLORS.len()) as u8),
        };
        profiles.push(info.clone());
        self.save_profiles(&profiles).await?;

        tracing::info!(profile_id = %info.id, "Profile created");
        Ok(info)
    }

    /// Make `id` the session's active profile and remember it for restarts.
    pub async fn switch_profile(
        &self,
        session: &SessionContext,
        id: &ProfileId,
    ) -> Result<ProfileInfo, RegistryError> {
        let info = self
            .get_profile(id)
            .await?
            .ok_or_else(|| RegistryError::ProfileNotFound(id.clone()))?;
        self.storage
            .kv()
            .set(&self.global_key(ACTIVE_KEY), id.as_str())
            .await?;
        session.set_active(id.clone());
        tracing::info!(profile_id = %id, "Switched active profile");
        Ok(info)
    }

    /// Re-activate the last active profile, if it still exists.
    pub async fn restore_session(&self, session: &SessionContext) -> Result<Option<ProfileId>, RegistryError> {
        let Some(raw) = self.read_global(ACTIVE_KEY).await? else {
            return Ok(None);
        };
        let Ok(id) = ProfileId::new(raw) else {
            return Ok(None);
        };
        if self.get_profile(&id).await?.is_none() {
            tracing::warn!(profile_id = %id, "Last active profile no longer registered");
            return Ok(None);
        }
        session.set_active(id.clone());
        Ok(Some(id))
    }

    /// Merge a profile list from another device. Known ids take the remote
    /// name and manager; unknown ids are appended. Returns how many were added.
    pub async fn merge_profiles(&self, remote: Vec<ProfileInfo>) -> Result<usize, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut profiles = self.list_profiles().await?;
        let mut added = 0;

        for incoming in remote {
            match profiles.iter_mut().find(|p| p.id == incoming.id) {
                Some(existing) => {
                    existing.name = incoming.name;
                    existing.managed_by = incoming.managed_by;
                }
                None => {
                    let color_index = incoming
                        .color_index
                        .or(Some((profiles.len() % PROFILE_COLORS.len()) as u8));
                    profiles.push(ProfileInfo {
                        color_index,
                        ..incoming
                    });
                    added += 1;
                }
            }
        }

        self.save_profiles(&profiles).await?;
        tracing::info!(added, total = profiles.len(), "Profile list merged");
        Ok(added)
    }

    /// Wipe a profile's storage and drop it from the registry.
    pub async fn delete_profile(&self, id: &ProfileId) -> Result<WipeReport, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut profiles = self.list_profiles().await?;
        let before = profiles.len();
        profiles.retain(|p| &p.id != id);
        if profiles.len() == before {
            return Err(RegistryError::ProfileNotFound(id.clone()));
        }

        let report = self.storage.wipe_profile(id).await?;
        self.save_profiles(&profiles).await?;

        if self.read_global(ACTIVE_KEY).await?.as_deref() == Some(id.as_str()) {
            self.storage.kv().remove(&self.global_key(ACTIVE_KEY)).await?;
        }

        tracing::info!(profile_id = %id, "Profile deleted");
        Ok(report)
    }

    /// Move data written before profiles existed (bare logical keys) into
    /// `id`'s namespace. Sensitive values get encrypted on the way. Runs once
    /// per store; returns how many keys were moved.
    pub async fn migrate_legacy_data(&self, id: &ProfileId) -> Result<usize, RegistryError> {
        let marker = self.global_key(LEGACY_MARKER_KEY);
        if self.read_global(LEGACY_MARKER_KEY).await?.is_some() {
            return Ok(0);
        }
        if self.get_profile(id).await?.is_none() {
            return Err(RegistryError::ProfileNotFound(id.clone()));
        }

        let mut moved = 0;
        for legacy_key in LEGACY_KEYS {
            let Some(value) = self.storage.kv().get(legacy_key).await? else {
                continue;
            };
            if self.storage.get_item(id, legacy_key).await?.is_some() {
                tracing::warn!(profile_id = %id, key = legacy_key, "Namespaced value exists, legacy copy dropped");
            } else {
                self.storage.set_item(id, legacy_key, &value).await?;
                moved += 1;
            }
            self.storage.kv().remove(legacy_key).await?;
        }

        self.storage.kv().set(&marker, id.as_str()).await?;
        tracing::info!(profile_id = %id, moved, "Legacy data migrated");
        Ok(moved)
    }
}
