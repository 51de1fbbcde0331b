//! Per-profile encrypted storage for a family health tracker.
//!
//! Several family members' data share one key-value store. Each profile gets
//! its own key namespace, and sensitive categories (medications, exams,
//! vaccine records, ...) are sealed with a per-profile AES-256 key.

pub mod config;
pub mod crypto;
pub mod keys;
pub mod registry;
pub mod session;
pub mod storage;
pub mod store;

pub use crypto::{Clock, CryptoError, EncryptionEngine, Envelope, ManualClock, SystemClock};
pub use keys::{KeyCodec, KeyScheme, ProfileId};
pub use registry::{ProfileInfo, ProfileRegistry, RegistryError};
pub use session::{SessionContext, SessionError, SessionStorage};
pub use storage::{ProfileStorage, StorageError, WipeReport};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (`RUST_LOG`, else the crate default).
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}
