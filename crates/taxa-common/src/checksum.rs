//! Content hashing for cached payloads
//!
//! Every payload written to a provider cache is fingerprinted with SHA-256.
//! Hash equality is what decides whether a re-fetched record actually changed.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash an in-memory payload
    pub fn of(payload: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(payload)))
    }

    /// Rehydrate a digest previously produced by [`ContentHash::of`]
    pub fn from_hex(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value))
        } else {
            Err(CommonError::InvalidHash(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}
