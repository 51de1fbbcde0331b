//! Session context for UI integration.
//!
//! The storage facade always takes an explicit profile. `SessionStorage` is the
//! thin convenience layer for UI flows that act on "the current profile": each
//! call takes an optional profile and falls back to the session's active one.
//! With neither, reads return `None` and writes are skipped.

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::config::{AUTH_TOKEN, REFRESH_TOKEN};
use crate::keys::ProfileId;
use crate::registry::{ProfileRegistry, RegistryError};
use crate::storage::{ProfileStorage, StorageError, WipeReport};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// The profile one UI session is currently acting for.
#[derive(Debug, Default)]
pub struct SessionContext {
    active: RwLock<Option<ProfileId>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active(profile: ProfileId) -> Self {
        Self {
            active: RwLock::new(Some(profile)),
        }
    }

    pub fn active(&self) -> Option<ProfileId> {
        self.active.read().ok().and_then(|active| active.clone())
    }

    pub fn set_active(&self, profile: ProfileId) {
        if let Ok(mut active) = self.active.write() {
            *active = Some(profile);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut active) = self.active.write() {
            *active = None;
        }
    }

    /// Explicit profile first, then the active one.
    pub fn resolve(&self, explicit: Option<&ProfileId>) -> Option<ProfileId> {
        explicit.cloned().or_else(|| self.active())
    }
}

pub struct SessionStorage {
    storage: Arc<ProfileStorage>,
    registry: Arc<ProfileRegistry>,
    session: Arc<SessionContext>,
}

impl SessionStorage {
    pub fn new(registry: Arc<ProfileRegistry>, session: Arc<SessionContext>) -> Self {
        Self {
            storage: Arc::clone(registry.storage()),
            registry,
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn storage(&self) -> &Arc<ProfileStorage> {
        &self.storage
    }

    fn resolve(&self, profile: Option<&ProfileId>, op: &'static str, key: &str) -> Option<ProfileId> {
        let resolved = self.session.resolve(profile);
        if resolved.is_none() {
            tracing::debug!(op, key, "No profile resolved, skipping");
        }
        resolved
    }

    pub async fn get_item(
        &self,
        logical_key: &str,
        profile: Option<&ProfileId>,
    ) -> Result<Option<String>, SessionError> {
        let Some(profile) = self.resolve(profile, "get_item", logical_key) else {
            return Ok(None);
        };
        Ok(self.storage.get_item(&profile, logical_key).await?)
    }

    pub async fn set_item(
        &self,
        logical_key: &str,
        value: &str,
        profile: Option<&ProfileId>,
    ) -> Result<(), SessionError> {
        let Some(profile) = self.resolve(profile, "set_item", logical_key) else {
            return Ok(());
        };
        Ok(self.storage.set_item(&profile, logical_key, value).await?)
    }

    pub async fn remove_item(&self, logical_key: &str, profile: Option<&ProfileId>) -> Result<(), SessionError> {
        let Some(profile) = self.resolve(profile, "remove_item", logical_key) else {
            return Ok(());
        };
        Ok(self.storage.remove_item(&profile, logical_key).await?)
    }

    pub async fn set_secure_item(
        &self,
        logical_key: &str,
        value: &str,
        profile: Option<&ProfileId>,
    ) -> Result<(), SessionError> {
        let Some(profile) = self.resolve(profile, "set_secure_item", logical_key) else {
            return Ok(());
        };
        Ok(self.storage.set_secure_item(&profile, logical_key, value).await?)
    }

    /// Reads a secure item for the resolved profile.
    ///
    /// Recovery path: when no profile resolves and an auth or refresh token is
    /// requested, every registered profile's slot is searched. The first
    /// profile holding that token becomes the active profile.
    pub async fn get_secure_item(
        &self,
        logical_key: &str,
        profile: Option<&ProfileId>,
    ) -> Result<Option<String>, SessionError> {
        if let Some(profile) = self.session.resolve(profile) {
            return Ok(self.storage.get_secure_item(&profile, logical_key).await?);
        }
        if logical_key != AUTH_TOKEN && logical_key != REFRESH_TOKEN {
            tracing::debug!(key = logical_key, "No profile resolved for secure item");
            return Ok(None);
        }

        for info in self.registry.list_profiles().await? {
            if let Some(token) = self.storage.get_secure_item(&info.id, logical_key).await? {
                tracing::warn!(
                    profile_id = %info.id,
                    key = logical_key,
                    "No active profile, adopting the profile that holds the token"
                );
                self.registry.switch_profile(&self.session, &info.id).await?;
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    pub async fn remove_secure_item(
        &self,
        logical_key: &str,
        profile: Option<&ProfileId>,
    ) -> Result<(), SessionError> {
        let Some(profile) = self.resolve(profile, "remove_secure_item", logical_key) else {
            return Ok(());
        };
        Ok(self.storage.remove_secure_item(&profile, logical_key).await?)
    }

    pub async fn wipe_profile(&self, profile: Option<&ProfileId>) -> Result<Option<WipeReport>, SessionError> {
        let Some(profile) = self.resolve(profile, "wipe_profile", "*") else {
            return Ok(None);
        };
        Ok(Some(self.storage.wipe_profile(&profile).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, PROFILE_PIN};

    fn setup() -> (SessionStorage, Arc<ProfileRegistry>) {
        let config = StorageConfig {
            background_rotation: false,
            ..StorageConfig::default()
        };
        let registry = Arc::new(ProfileRegistry::new(Arc::new(ProfileStorage::in_memory(&config))));
        let scoped = SessionStorage::new(Arc::clone(&registry), Arc::new(SessionContext::new()));
        (scoped, registry)
    }

    #[test]
    fn resolve_prefers_explicit_profile() {
        let active = ProfileId::new("active").unwrap();
        let explicit = ProfileId::new("explicit").unwrap();
        let session = SessionContext::with_active(active.clone());

        assert_eq!(session.resolve(Some(&explicit)), Some(explicit));
        assert_eq!(session.resolve(None), Some(active));

        session.clear();
        assert_eq!(session.resolve(None), None);
    }

    #[tokio::test]
    async fn unresolved_profile_reads_none_and_skips_writes() {
        let (scoped, _) = setup();

        scoped.set_item("theme", "dark", None).await.unwrap();
        scoped.set_secure_item(PROFILE_PIN, "1234", None).await.unwrap();

        assert!(scoped.get_item("theme", None).await.unwrap().is_none());
        assert!(scoped.get_secure_item(PROFILE_PIN, None).await.unwrap().is_none());
        assert!(scoped.wipe_profile(None).await.unwrap().is_none());
        assert!(scoped.storage().kv().get_all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn implicit_calls_use_active_profile() {
        let (scoped, registry) = setup();
        let maria = registry.create_profile("Maria", None).await.unwrap();
        let leo = registry.create_profile("Leo", None).await.unwrap();
        registry.switch_profile(scoped.session(), &maria.id).await.unwrap();

        scoped.set_item("medications", "[\"Aspirin\"]", None).await.unwrap();
        scoped.set_item("medications", "[\"Insulin\"]", Some(&leo.id)).await.unwrap();

        assert_eq!(
            scoped.get_item("medications", None).await.unwrap().as_deref(),
            Some("[\"Aspirin\"]")
        );
        assert_eq!(
            scoped.storage().get_item(&leo.id, "medications").await.unwrap().as_deref(),
            Some("[\"Insulin\"]")
        );

        scoped.remove_item("medications", None).await.unwrap();
        assert!(scoped.get_item("medications", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_lookup_recovers_active_profile() {
        let (scoped, registry) = setup();
        let maria = registry.create_profile("Maria", None).await.unwrap();
        let leo = registry.create_profile("Leo", None).await.unwrap();
        scoped
            .set_secure_item(REFRESH_TOKEN, "refresh-leo", Some(&leo.id))
            .await
            .unwrap();

        assert!(scoped.session().active().is_none());
        let token = scoped.get_secure_item(REFRESH_TOKEN, None).await.unwrap();

        assert_eq!(token.as_deref(), Some("refresh-leo"));
        assert_eq!(scoped.session().active(), Some(leo.id.clone()));
        assert_ne!(scoped.session().active(), Some(maria.id));

        // Recovery is remembered across restarts.
        let restarted = SessionContext::new();
        assert_eq!(
            registry.restore_session(&restarted).await.unwrap(),
            Some(leo.id)
        );
    }

    #[tokio::test]
    async fn recovery_only_applies_to_tokens() {
        let (scoped, registry) = setup();
        let maria = registry.create_profile("Maria", None).await.unwrap();
        scoped
            .set_secure_item(PROFILE_PIN, "1234", Some(&maria.id))
            .await
            .unwrap();

        assert!(scoped.get_secure_item(PROFILE_PIN, None).await.unwrap().is_none());
        assert!(scoped.get_secure_item(AUTH_TOKEN, None).await.unwrap().is_none());
        assert!(scoped.session().active().is_none());
    }

    #[tokio::test]
    async fn wipe_uses_active_profile() {
        let (scoped, registry) = setup();
        let maria = registry.create_profile("Maria", None).await.unwrap();
        scoped.session().set_active(maria.id.clone());

        scoped.set_item("theme", "dark", None).await.unwrap();
        scoped.set_secure_item(AUTH_TOKEN, "tok", None).await.unwrap();

        let report = scoped.wipe_profile(None).await.unwrap().unwrap();
        assert_eq!(report.keys_removed, 1);
        assert_eq!(report.secure_items_removed, 1);
        assert!(scoped.get_secure_item(AUTH_TOKEN, None).await.unwrap().is_none());

        scoped.remove_secure_item(AUTH_TOKEN, None).await.unwrap();
    }
}
