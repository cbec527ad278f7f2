//! Content-addressed hashing primitives
//!
//! Provides [`ContentHash`], a strongly-typed SHA-256 digest used as the key
//! of every stored prompt, input and output.

use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte content hash (SHA-256 of the UTF-8 bytes)
///
/// Displayed and serialized as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create hash from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != 32 {
            return Err(HashError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Compute the SHA-256 hash of arbitrary data
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    /// Hash of a text blob as stored by a content store
    #[inline]
    #[must_use]
    pub fn of_text(text: &str) -> Self {
        Self::compute(text.as_bytes())
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Whether `text` hashes to this value
    #[inline]
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        Self::of_text(text) == *self
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8; 32]> for ContentHash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when working with content hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_sha256_vector() {
        let hash = ContentHash::of_text("abc");
        assert_eq!(
            hash.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn from_slice_invalid_length() {
        let result = ContentHash::from_slice(&[1u8; 31]);
        assert!(matches!(
            result,
            Err(HashError::InvalidLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn display_and_parse() {
        let hash = ContentHash::of_text("system prompt");
        let parsed: ContentHash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!(hash.to_string().starts_with(&hash.short()));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(
            "zz".parse::<ContentHash>(),
            Err(HashError::HexDecode(_))
        ));
    }

    #[test]
    fn serde_is_hex_string() {
        let hash = ContentHash::of_text("x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let decoded: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, hash);
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(text in ".*") {
            prop_assert_eq!(ContentHash::of_text(&text), ContentHash::of_text(&text));
            prop_assert!(ContentHash::of_text(&text).matches(&text));
        }

        #[test]
        fn prop_distinct_text_distinct_hash(a in ".{0,64}", b in ".{0,64}") {
            prop_assume!(a != b);
            prop_assert_ne!(ContentHash::of_text(&a), ContentHash::of_text(&b));
        }
    }
}
