use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-width identifier of a derived artifact.
///
/// Always 64 lowercase hex characters (a SHA-256 digest). Construction from
/// arbitrary strings is validated so a key can double as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

pub const CACHE_KEY_LEN: usize = 64;

impl CacheKey {
    /// Hex-encode a 32-byte digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        CacheKey(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = value.len() == CACHE_KEY_LEN
            && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(CacheKey(value))
        } else {
            Err(format!("not a {CACHE_KEY_LEN}-character lowercase hex key: {value:?}"))
        }
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}
