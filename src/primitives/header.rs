//! Fixed 100-byte block header: codec and identity hash.
//!
//! Layout (all integers little-endian):
//! version(4) prev_id(32) miner(20) time(4) bits(4) nonce(4) pow_commitment(32)

use crate::errors::WireError;
use crate::primitives::{sha256d, Hash160, Hash256};

pub const HEADER_SIZE: usize = 100;

/// The first 68 bytes are the PoW input; the commitment covers them.
pub const POW_INPUT_SIZE: usize = 68;

// layout must add up exactly
const _: () = assert!(4 + 32 + 20 + 4 + 4 + 4 + 32 == HEADER_SIZE);
const _: () = assert!(HEADER_SIZE - 32 == POW_INPUT_SIZE);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_id: Hash256,
    pub miner: Hash160,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub pow_commitment: Hash256,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_id.0);
        out[36..56].copy_from_slice(&self.miner.0);
        out[56..60].copy_from_slice(&self.time.to_le_bytes());
        out[60..64].copy_from_slice(&self.bits.to_le_bytes());
        out[64..68].copy_from_slice(&self.nonce.to_le_bytes());
        out[68..100].copy_from_slice(&self.pow_commitment.0);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<BlockHeader, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::TruncatedPayload);
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut miner = [0u8; 20];
        miner.copy_from_slice(&bytes[36..56]);
        let mut commitment = [0u8; 32];
        commitment.copy_from_slice(&bytes[68..100]);
        Ok(BlockHeader {
            version: i32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
            prev_id: Hash256(prev),
            miner: Hash160(miner),
            time: u32::from_le_bytes(bytes[56..60].try_into().expect("4 bytes")),
            bits: u32::from_le_bytes(bytes[60..64].try_into().expect("4 bytes")),
            nonce: u32::from_le_bytes(bytes[64..68].try_into().expect("4 bytes")),
            pow_commitment: Hash256(commitment),
        })
    }

    /// Block id: double-SHA-256 of the serialized header, byte-reversed.
    pub fn id(&self) -> Hash256 {
        let mut digest = sha256d(&self.encode());
        digest.reverse();
        Hash256(digest)
    }

    /// The 68-byte prefix the PoW artifact commits to.
    pub fn pow_input(&self) -> [u8; POW_INPUT_SIZE] {
        let encoded = self.encode();
        let mut out = [0u8; POW_INPUT_SIZE];
        out.copy_from_slice(&encoded[..POW_INPUT_SIZE]);
        out
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_id.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_id: Hash256([7u8; 32]),
            miner: Hash160([9u8; 20]),
            time: 1_700_000_000,
            bits: 0x207fffff,
            nonce: 42,
            pow_commitment: Hash256([3u8; 32]),
        }
    }

    #[test]
    fn encoding_is_exactly_100_bytes() {
        assert_eq!(sample_header().encode().len(), HEADER_SIZE);
    }

    #[test]
    fn encode_decode_identity() {
        let h = sample_header();
        let decoded = BlockHeader::decode(&h.encode()).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn decode_rejects_short_input() {
        let h = sample_header().encode();
        assert_eq!(
            BlockHeader::decode(&h[..99]),
            Err(WireError::TruncatedPayload)
        );
    }

    #[test]
    fn id_changes_with_nonce() {
        let a = sample_header();
        let mut b = a;
        b.nonce += 1;
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn pow_input_excludes_commitment() {
        let a = sample_header();
        let mut b = a;
        b.pow_commitment = Hash256([0xff; 32]);
        assert_eq!(a.pow_input(), b.pow_input());
        assert_ne!(a.id(), b.id());
    }
}
