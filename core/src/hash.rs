//! Content hashes: 20-byte truncated BLAKE3 digests.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Length in bytes of a content hash.
pub const HASH_LEN: usize = 20;

/// 20-byte identifier of a chunk. A chunk's hash is the BLAKE3 digest of
/// its stored bytes truncated to 20 bytes, so equality of hashes implies
/// equality of content.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Default,
)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Compute the hash of a byte sequence.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = blake3::hash(bytes);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest.as_bytes()[..HASH_LEN]);
        Hash(out)
    }

    /// The all-zero hash, used as a sentinel for "no value".
    pub fn zero() -> Self {
        Hash([0u8; HASH_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Lowercase hex rendering (40 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 40-char hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != HASH_LEN * 2 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Some(Hash(out))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl serde::Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Hash::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hash hex"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = Hash::of(b"hello world");
        let b = Hash::of(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Hash::of(b"hello worlds"));
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash::of(b"some chunk");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(Hash::from_hex(&hex), Some(h));
        assert_eq!(Hash::from_hex("zz"), None);
    }

    #[test]
    fn zero_sentinel() {
        assert!(Hash::zero().is_zero());
        assert!(!Hash::of(b"x").is_zero());
    }
}
