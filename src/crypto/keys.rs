use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use super::envelope::Envelope;
use super::CryptoError;

pub const KEY_LENGTH: usize = 32; // AES-256

/// Bytes of the SHA-256 fingerprint used as a key id.
const KEY_ID_BYTES: usize = 8;

const KEY_ID_DOMAIN: &[u8] = b"profile-vault/key-id/v1";

/// Per-profile encryption key, zeroed on drop
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct ProfileKey {
    key_bytes: [u8; KEY_LENGTH],
}

impl ProfileKey {
    /// Fresh random key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut key_bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key_bytes);
        Self { key_bytes }
    }

    pub(crate) fn from_bytes(key_bytes: [u8; KEY_LENGTH]) -> Self {
        Self { key_bytes }
    }

    /// Parse key material as persisted in the secure store (hex).
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|_| CryptoError::CorruptedKey)?,
        );
        if decoded.len() != KEY_LENGTH {
            return Err(CryptoError::CorruptedKey);
        }
        let mut key_bytes = [0u8; KEY_LENGTH];
        key_bytes.copy_from_slice(&decoded);
        Ok(Self { key_bytes })
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.key_bytes))
    }

    /// Stable public fingerprint naming this key inside envelopes.
    pub fn key_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(KEY_ID_DOMAIN);
        hasher.update(self.key_bytes);
        hex::encode(&hasher.finalize()[..KEY_ID_BYTES])
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key_bytes
    }

    pub(crate) fn duplicate(&self) -> Self {
        Self::from_bytes(self.key_bytes)
    }

    /// Encrypt with AES-256-CBC under a fresh IV
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        Envelope::seal(&self.key_bytes, plaintext)
    }

    /// Decrypt an envelope sealed with this key
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        envelope.open(&self.key_bytes)
    }
}

impl fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileKey")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}
