use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::KEY_LENGTH;
use super::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const IV_LENGTH: usize = 16;

/// Encrypted value at rest.
///
/// `ciphertext` is base64 AES-256-CBC output (PKCS7), `iv` is hex.
/// `key_id` names the key that sealed it; envelopes written by older
/// builds do not carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
    #[serde(rename = "keyId", default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl Envelope {
    pub(crate) fn seal(key_bytes: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<Self, CryptoError> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key_bytes, &iv)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        Ok(Self {
            ciphertext: BASE64.encode(ciphertext),
            iv: hex::encode(iv),
            key_id: None,
        })
    }

    /// Decrypt. An empty plaintext counts as a failure.
    pub(crate) fn open(&self, key_bytes: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, CryptoError> {
        let iv = hex::decode(&self.iv).map_err(|_| CryptoError::InvalidEnvelope("iv is not hex"))?;
        if iv.len() != IV_LENGTH {
            return Err(CryptoError::InvalidEnvelope("iv must be 16 bytes"));
        }
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| CryptoError::InvalidEnvelope("ciphertext is not base64"))?;

        let cipher = Aes256CbcDec::new_from_slices(key_bytes, &iv)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if plaintext.is_empty() {
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(plaintext)
    }

    /// Structural match: an object whose `ciphertext` and `iv` are both strings.
    /// Anything else is legacy plaintext.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let ciphertext = object.get("ciphertext")?.as_str()?;
        let iv = object.get("iv")?.as_str()?;
        let key_id = object
            .get("keyId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            ciphertext: ciphertext.to_string(),
            iv: iv.to_string(),
            key_id,
        })
    }

    /// Parse a raw stored string; `None` when it is not an envelope.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        Self::from_value(&value)
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LENGTH] = [0x42; KEY_LENGTH];

    #[test]
    fn seal_open_round_trip() {
        let sealed = Envelope::seal(&KEY, b"Aspirin 100mg").unwrap();
        assert_eq!(sealed.open(&KEY).unwrap(), b"Aspirin 100mg");
    }

    #[test]
    fn iv_is_fresh_per_seal() {
        let a = Envelope::seal(&KEY, b"same").unwrap();
        let b = Envelope::seal(&KEY, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(hex::decode(&a.iv).unwrap().len(), IV_LENGTH);
    }

    #[test]
    fn ciphertext_is_block_aligned() {
        let sealed = Envelope::seal(&KEY, &[1u8; 16]).unwrap();
        // PKCS7 always pads, so 16 bytes of input become 32.
        assert_eq!(BASE64.decode(&sealed.ciphertext).unwrap().len(), 32);
    }

    #[test]
    fn empty_plaintext_is_rejected_on_open() {
        let sealed = Envelope::seal(&KEY, b"").unwrap();
        assert!(matches!(sealed.open(&KEY), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let mut sealed = Envelope::seal(&KEY, b"some medical data").unwrap();
        let mut bytes = BASE64.decode(&sealed.ciphertext).unwrap();
        bytes.truncate(bytes.len() - 3);
        sealed.ciphertext = BASE64.encode(bytes);
        assert!(sealed.open(&KEY).is_err());
    }

    #[test]
    fn malformed_iv_is_invalid_envelope() {
        let mut sealed = Envelope::seal(&KEY, b"x").unwrap();
        sealed.iv = "zz".to_string();
        assert!(matches!(
            sealed.open(&KEY),
            Err(CryptoError::InvalidEnvelope(_))
        ));
        sealed.iv = "abcd".to_string();
        assert!(matches!(
            sealed.open(&KEY),
            Err(CryptoError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn parse_recognises_envelopes_only() {
        let sealed = Envelope::seal(&KEY, b"x").unwrap();
        let json = sealed.to_json().unwrap();
        assert!(!json.contains("keyId"));
        assert_eq!(Envelope::parse(&json), Some(sealed));

        assert!(Envelope::parse("plain text").is_none());
        assert!(Envelope::parse("[1,2,3]").is_none());
        assert!(Envelope::parse(r#"{"ciphertext":"abc"}"#).is_none());
        assert!(Envelope::parse(r#"{"ciphertext":1,"iv":"00"}"#).is_none());
    }

    #[test]
    fn parse_reads_key_id() {
        let raw = r#"{"ciphertext":"AAAA","iv":"00","keyId":"0011223344556677"}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.key_id.as_deref(), Some("0011223344556677"));
    }
}
