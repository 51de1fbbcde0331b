use std::path::PathBuf;

use chrono::Duration;

use crate::keys::KeyScheme;
use crate::store::SecureBackend;

/// Application-level constants
pub const APP_NAME: &str = "ProfileVault";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every composite storage key written by this crate.
pub const DEFAULT_KEY_PREFIX: &str = "pv";

/// Age after which a profile encryption key is due for rotation.
pub const KEY_ROTATION_DAYS: i64 = 90;

/// Logical keys whose values are always encrypted before persistence.
pub const SENSITIVE_KEYS: [&str; 9] = [
    "medications",
    "medicalExams",
    "doctorVisits",
    "emergencyContacts",
    "medicationLogs",
    "anamnesis",
    "dailyTracking",
    "vaccineRecords",
    "customVaccines",
];

// Secure-item names (routed to the secure store, never the plain store)
pub const AUTH_TOKEN: &str = "authToken";
pub const REFRESH_TOKEN: &str = "refreshToken";
pub const PROFILE_PIN: &str = "profilePin";
pub const ENCRYPTION_KEY: &str = "encryptionKey";
pub const ENCRYPTION_KEY_NEW: &str = "encryptionKey_new";
pub const ENCRYPTION_KEY_OLD: &str = "encryptionKey_old";
pub const ENCRYPTION_KEY_CREATED_AT: &str = "encryptionKeyCreatedAt";

/// Secure items removed when a profile is wiped.
pub const PROFILE_SECURE_ITEMS: [&str; 7] = [
    AUTH_TOKEN,
    REFRESH_TOKEN,
    PROFILE_PIN,
    ENCRYPTION_KEY,
    ENCRYPTION_KEY_NEW,
    ENCRYPTION_KEY_OLD,
    ENCRYPTION_KEY_CREATED_AT,
];

/// Bare (pre-namespacing) keys that older builds wrote directly to the store.
pub const LEGACY_KEYS: [&str; 13] = [
    "medications",
    "medicalExams",
    "doctorVisits",
    "emergencyContacts",
    "medicationLogs",
    "anamnesis",
    "dailyTracking",
    "vaccineRecords",
    "customVaccines",
    "alarms",
    "userProfile",
    "settings",
    "theme",
];

/// Whether values stored under `logical_key` go through the encryption engine.
pub fn is_sensitive(logical_key: &str) -> bool {
    SENSITIVE_KEYS.contains(&logical_key)
}

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "profile_vault=info,warn"
}

/// Get the application data directory (~/ProfileVault/).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the persistent key-value store.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("storage.db")
}

/// Tunables for the storage facade and encryption engine.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub key_prefix: String,
    pub key_scheme: KeyScheme,
    pub rotation_window: Duration,
    /// Spawn a rotation check on every sensitive write.
    pub background_rotation: bool,
    pub secure_backend: SecureBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_scheme: KeyScheme::Hashed,
            rotation_window: Duration::days(KEY_ROTATION_DAYS),
            background_rotation: true,
            secure_backend: SecureBackend::platform_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_set_is_exact() {
        for key in SENSITIVE_KEYS {
            assert!(is_sensitive(key), "{key} should be sensitive");
        }
        assert!(!is_sensitive("theme"));
        assert!(!is_sensitive("profilePin"));
        assert!(!is_sensitive("Medications"), "Membership is case-sensitive");
    }

    #[test]
    fn legacy_keys_cover_every_sensitive_key() {
        for key in SENSITIVE_KEYS {
            assert!(LEGACY_KEYS.contains(&key));
        }
    }

    #[test]
    fn default_config_uses_hashed_scheme_and_ninety_days() {
        let config = StorageConfig::default();
        assert_eq!(config.key_prefix, "pv");
        assert_eq!(config.key_scheme, KeyScheme::Hashed);
        assert_eq!(config.rotation_window.num_days(), 90);
    }

    #[test]
    fn default_config_keeps_secure_items_out_of_the_plain_store() {
        let config = StorageConfig::default();
        assert_eq!(config.secure_backend, SecureBackend::platform_default());
        if cfg!(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "windows"
        )) {
            assert_eq!(config.secure_backend, SecureBackend::Keyring);
        }
    }

    #[test]
    fn default_db_path_under_app_data() {
        let path = default_db_path();
        assert!(path.starts_with(app_data_dir()));
        assert!(path.ends_with("storage.db"));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.6.0");
    }
}
