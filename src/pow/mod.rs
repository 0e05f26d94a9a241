//! Memory-hard proof of work with epoch-rotated keys.
//!
//! Three verification modes:
//! - MINE: compute the artifact for a header's 68-byte PoW input.
//! - FULL: recompute the artifact, require bit-equality with the header's
//!   commitment and artifact <= target.
//! - COMMITMENT_ONLY: require int(commitment) <= target. Roughly 50x
//!   cheaper; a pre-filter only, never proof the artifact was computed.
//!
//! The epoch key is blake3(chain_seed, epoch_index) where
//! epoch_index = header.time / epoch_duration. At most two epoch datasets
//! (current and previous) are held in memory.

mod dataset;

pub use dataset::Dataset;

use crate::errors::PowError;
use crate::primitives::header::BlockHeader;
use crate::primitives::uint256::compact_to_target;
use crate::primitives::{Hash256, U256};
use dataset::SplitMix64;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Tunables for the memory-hard mix. Consensus-critical: every node on a
/// network must run identical values.
#[derive(Clone, Copy, Debug)]
pub struct PowParams {
    pub dataset_kib: usize,
    pub mix_iters: u32,
    pub reads_per_iter: u32,
    pub epoch_duration_secs: u64,
}

impl PowParams {
    /// Stable fingerprint for log lines, to catch parameter drift between
    /// nodes at a glance.
    pub fn fingerprint(&self) -> String {
        format!(
            "v=1 dataset_kib={} mix_iters={} reads_per_iter={} epoch_secs={}",
            self.dataset_kib, self.mix_iters, self.reads_per_iter, self.epoch_duration_secs,
        )
    }
}

pub struct PowEngine {
    params: PowParams,
    chain_seed: [u8; 32],
    // epoch index -> dataset; trimmed to the two newest epochs
    cache: Mutex<HashMap<u64, Arc<Dataset>>>,
}

impl PowEngine {
    pub fn new(params: PowParams, chain_seed: [u8; 32]) -> Self {
        Self {
            params,
            chain_seed,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &PowParams {
        &self.params
    }

    pub fn epoch_for_time(&self, time: u32) -> u64 {
        time as u64 / self.params.epoch_duration_secs.max(1)
    }

    fn epoch_key(&self, epoch: u64) -> [u8; 32] {
        *blake3::keyed_hash(&self.chain_seed, &epoch.to_le_bytes()).as_bytes()
    }

    /// Fetch or build the dataset for an epoch. Keeps at most the two
    /// newest epochs resident.
    fn dataset(&self, epoch: u64) -> Arc<Dataset> {
        let mut cache = self.cache.lock();
        if let Some(d) = cache.get(&epoch) {
            return Arc::clone(d);
        }
        let key = self.epoch_key(epoch);
        let built = Arc::new(Dataset::build(self.params.dataset_kib, &key, epoch));
        cache.insert(epoch, Arc::clone(&built));
        if cache.len() > 2 {
            let mut epochs: Vec<u64> = cache.keys().copied().collect();
            epochs.sort_unstable();
            for stale in &epochs[..epochs.len() - 2] {
                cache.remove(stale);
            }
        }
        built
    }

    /// MINE mode: compute the artifact for the header's PoW input.
    pub fn compute(&self, header: &BlockHeader) -> Hash256 {
        let epoch = self.epoch_for_time(header.time);
        let dataset = self.dataset(epoch);
        mix_artifact(&self.params, &dataset, &header.pow_input())
    }

    /// COMMITMENT_ONLY mode: int(commitment) <= target(bits). Does not
    /// prove the artifact was computed; FULL must follow before a header
    /// becomes chain-viable.
    pub fn check_commitment(header: &BlockHeader) -> Result<(), PowError> {
        let target = compact_to_target(header.bits)?;
        if header.pow_commitment.to_u256() > target {
            return Err(PowError::CommitmentExceedsTarget);
        }
        Ok(())
    }

    /// FULL mode: commitment in range and bit-identical to the recomputed
    /// artifact.
    pub fn verify_full(&self, header: &BlockHeader) -> Result<(), PowError> {
        Self::check_commitment(header)?;
        let artifact = self.compute(header);
        if artifact != header.pow_commitment {
            return Err(PowError::ArtifactMismatch);
        }
        Ok(())
    }

    /// FULL-verify a batch on the rayon pool. Returns the ids that passed.
    pub fn verify_full_batch(&self, headers: &[BlockHeader]) -> Vec<(Hash256, Result<(), PowError>)> {
        use rayon::prelude::*;
        // warm the datasets serially so the parallel pass only reads
        for h in headers {
            let _ = self.dataset(self.epoch_for_time(h.time));
        }
        headers
            .par_iter()
            .map(|h| (h.id(), self.verify_full(h)))
            .collect()
    }

    /// Grind nonces until FULL verification passes. Test and regtest
    /// facility; production mining is out of scope.
    pub fn mine_header(&self, header: &mut BlockHeader) -> Result<(), PowError> {
        let target = compact_to_target(header.bits)?;
        loop {
            let artifact = self.compute(header);
            if artifact.to_u256() <= target {
                header.pow_commitment = artifact;
                return Ok(());
            }
            header.nonce = header.nonce.wrapping_add(1);
        }
    }
}

/// The memory-hard mix: a register file walked through dataset-dependent
/// reads, finalized with blake3. The 68-byte input already contains the
/// nonce.
fn mix_artifact(params: &PowParams, dataset: &Dataset, input: &[u8; 68]) -> Hash256 {
    let seed_hash = blake3::hash(input);
    let seed = seed_hash.as_bytes();

    let mut lanes = [0u64; 4];
    for (i, lane) in lanes.iter_mut().enumerate() {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&seed[i * 8..i * 8 + 8]);
        *lane = u64::from_le_bytes(buf);
    }
    let mut sm = SplitMix64::new(lanes[0] ^ lanes[1] ^ lanes[2] ^ lanes[3]);

    for _ in 0..params.mix_iters {
        for r in 0..params.reads_per_iter as usize {
            let idx = (lanes[r % 4] ^ sm.next()) as usize & dataset.mask;
            let word = dataset.mem[idx];
            lanes[(r + 1) % 4] = lanes[(r + 1) % 4]
                .rotate_left(13)
                ^ word.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
        lanes[0] = lanes[0].wrapping_add(sm.next());
    }

    let mut fin = [0u8; 64];
    fin[..32].copy_from_slice(seed);
    for (i, lane) in lanes.iter().enumerate() {
        fin[32 + i * 8..32 + i * 8 + 8].copy_from_slice(&lane.to_le_bytes());
    }
    Hash256(*blake3::hash(&fin).as_bytes())
}

/// Target for the given bits, as a `U256`. Thin convenience wrapper.
pub fn target_from_bits(bits: u32) -> Result<U256, PowError> {
    compact_to_target(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Hash160, Hash256};

    fn test_engine() -> PowEngine {
        PowEngine::new(
            PowParams {
                dataset_kib: 64,
                mix_iters: 8,
                reads_per_iter: 4,
                epoch_duration_secs: 86_400,
            },
            [0xcb; 32],
        )
    }

    fn test_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_id: Hash256([1u8; 32]),
            miner: Hash160([2u8; 20]),
            time: 1_700_000_000,
            bits: 0x207fffff,
            nonce: 0,
            pow_commitment: Hash256::ZERO,
        }
    }

    #[test]
    fn mine_then_full_verify() {
        let engine = test_engine();
        let mut header = test_header();
        engine.mine_header(&mut header).unwrap();
        assert_eq!(engine.verify_full(&header), Ok(()));
    }

    #[test]
    fn full_implies_commitment_only() {
        let engine = test_engine();
        let mut header = test_header();
        engine.mine_header(&mut header).unwrap();
        assert_eq!(engine.verify_full(&header), Ok(()));
        assert_eq!(PowEngine::check_commitment(&header), Ok(()));
    }

    #[test]
    fn commitment_only_does_not_imply_full() {
        let engine = test_engine();
        let mut header = test_header();
        // a forged commitment inside the target range passes the cheap
        // check but fails the recomputation
        header.pow_commitment = Hash256::ZERO;
        assert_eq!(PowEngine::check_commitment(&header), Ok(()));
        assert_eq!(
            engine.verify_full(&header),
            Err(PowError::ArtifactMismatch)
        );
    }

    #[test]
    fn commitment_above_target_rejected() {
        let mut header = test_header();
        header.pow_commitment = Hash256([0xff; 32]);
        assert_eq!(
            PowEngine::check_commitment(&header),
            Err(PowError::CommitmentExceedsTarget)
        );
    }

    #[test]
    fn non_canonical_bits_rejected() {
        let mut header = test_header();
        header.bits = 0x04923456; // sign bit set
        assert_eq!(
            PowEngine::check_commitment(&header),
            Err(PowError::NonCanonicalTarget)
        );
    }

    #[test]
    fn epoch_rotation_changes_artifact() {
        let engine = test_engine();
        let a = test_header();
        let mut b = a;
        // push b into the next epoch
        b.time = a.time + 86_400;
        let art_a = engine.compute(&a);
        let art_b = engine.compute(&b);
        assert_ne!(art_a, art_b);
        // determinism within the epoch
        assert_eq!(engine.compute(&a), art_a);
    }

    #[test]
    fn cache_holds_two_epochs() {
        let engine = test_engine();
        for epoch in 0..5u64 {
            let mut h = test_header();
            h.time = (epoch * 86_400) as u32 + 10;
            let _ = engine.compute(&h);
        }
        let cache = engine.cache.lock();
        assert!(cache.len() <= 2);
        assert!(cache.contains_key(&4));
        assert!(cache.contains_key(&3));
    }

    #[test]
    fn batch_verification_matches_single() {
        let engine = test_engine();
        let mut good = test_header();
        engine.mine_header(&mut good).unwrap();
        let mut bad = test_header();
        bad.nonce = good.nonce.wrapping_add(7);
        bad.pow_commitment = Hash256::ZERO;

        let results = engine.verify_full_batch(&[good, bad]);
        assert_eq!(results[0].1, Ok(()));
        assert_eq!(results[1].1, Err(PowError::ArtifactMismatch));
    }
}
