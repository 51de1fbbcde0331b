pub mod engine;
pub mod envelope;
pub mod keys;

pub use engine::*;
pub use envelope::*;
pub use keys::*;

use thiserror::Error;

use crate::keys::KeyError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("Stored key material is corrupted")]
    CorruptedKey,

    #[error("Envelope was sealed with an unknown key: {0}")]
    UnknownKey(String),

    #[error("Key lock poisoned")]
    LockPoisoned,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Secure store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid storage key: {0}")]
    Key(#[from] KeyError),
}
