//! Composite storage keys.
//!
//! Every value lives under `prefix + "_" + profile segment + "_" + key segment`.
//! Two schemes exist:
//! - `Legacy`: character substitution, byte-compatible with data written by
//!   older builds. Not injective (see tests).
//! - `Hashed`: both segments are truncated SHA-256 hex digests. Fixed length,
//!   so a profile's namespace prefix can never match another profile's keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex characters kept from each SHA-256 digest (128 bits).
const HASHED_SEGMENT_LEN: usize = 32;

/// Replacement for a forced first/last character.
const EDGE_FILL: &str = "x";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Profile identifier must not be empty")]
    EmptyProfileId,

    #[error("Logical key must not be empty")]
    EmptyLogicalKey,
}

/// Opaque, non-empty identifier of one family member's data partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(raw: impl Into<String>) -> Result<Self, KeyError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(KeyError::EmptyProfileId);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProfileId {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    Legacy,
    Hashed,
}

/// Make `raw` safe for any storage driver.
///
/// Characters outside `[A-Za-z0-9._-]` become `_` (a run of them collapses to a
/// single `_`), then the first and last characters are overwritten with `x`
/// if they are not alphanumeric.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_replaced_run = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_replaced_run = false;
        } else if !in_replaced_run {
            out.push('_');
            in_replaced_run = true;
        }
    }

    if out.is_empty() {
        return EDGE_FILL.to_string();
    }
    // `out` is pure ASCII from here on, so byte ranges are char boundaries.
    if !out.as_bytes()[0].is_ascii_alphanumeric() {
        out.replace_range(0..1, EDGE_FILL);
    }
    let last = out.len() - 1;
    if !out.as_bytes()[last].is_ascii_alphanumeric() {
        out.replace_range(last.., EDGE_FILL);
    }
    out
}

fn hashed_segment(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASHED_SEGMENT_LEN);
    encoded
}

/// Maps `(logical key, profile)` pairs to composite storage keys.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
    scheme: KeyScheme,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>, scheme: KeyScheme) -> Self {
        Self {
            prefix: prefix.into(),
            scheme,
        }
    }

    pub fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    fn segment(&self, raw: &str) -> String {
        match self.scheme {
            KeyScheme::Legacy => sanitize(raw),
            KeyScheme::Hashed => hashed_segment(raw),
        }
    }

    /// Composite key for `logical_key` inside `profile`'s namespace.
    pub fn compose(&self, logical_key: &str, profile: &ProfileId) -> Result<String, KeyError> {
        if logical_key.is_empty() {
            return Err(KeyError::EmptyLogicalKey);
        }
        Ok(format!(
            "{}{}",
            self.profile_namespace(profile),
            self.segment(logical_key)
        ))
    }

    /// Prefix shared by every composite key of `profile`.
    pub fn profile_namespace(&self, profile: &ProfileId) -> String {
        format!("{}_{}_", self.prefix, self.segment(profile.as_str()))
    }

    /// Key outside every profile namespace (registry bookkeeping).
    ///
    /// Profile segments start with an alphanumeric character, so no composite
    /// key or namespace begins with `<prefix>__`.
    pub fn global_key(&self, name: &str) -> String {
        format!("{}__{}", self.prefix, sanitize(name))
    }

    /// Where older builds kept `global_key(name)`. Under the legacy scheme
    /// this overlaps the namespace of a profile with a lookalike id.
    pub fn single_separator_global_key(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, sanitize(name))
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_KEY_PREFIX, KeyScheme::Hashed)
    }
}
