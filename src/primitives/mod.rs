//! Fixed-width primitive types shared by consensus and networking.
//!
//! `Hash256` and `Hash160` are opaque byte identifiers in on-wire
//! little-endian order; comparison and hashing are byte-wise. `U256` is the
//! arithmetic type used for targets and cumulative chain work.

pub mod header;
pub mod uint256;

pub use uint256::U256;

use std::fmt;
use std::str::FromStr;

/// 256-bit identifier (block id, previous-block id, PoW artifact).
/// Bytes are in on-wire little-endian order; `Display` shows the
/// conventional reversed (big-endian) hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

/// 160-bit identifier (miner address field).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash160(pub [u8; 20]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Interpret the bytes as a little-endian 256-bit integer.
    pub fn to_u256(&self) -> U256 {
        U256::from_le_bytes(&self.0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        f.write_str(&hex::encode(rev))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Hash256(bytes))
    }
}

impl serde::Serialize for Hash256 {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Hash256 {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Hash160 {
    pub const ZERO: Hash160 = Hash160([0u8; 20]);
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash160({})", self)
    }
}

/// SHA-256(SHA-256(data)). Fresh hasher state for both passes.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash256_display_reverses() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let h = Hash256(bytes);
        let s = h.to_string();
        assert!(s.ends_with("ab"));
        assert_eq!(s.len(), 64);
    }

    #[test]
    fn hash256_roundtrip_string() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let h = Hash256(bytes);
        let parsed: Hash256 = h.to_string().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn sha256d_known_vector() {
        // double-SHA of empty input
        let d = sha256d(b"");
        assert_eq!(
            hex::encode(d),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
