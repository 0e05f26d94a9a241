//! Per-network chain parameters.
//!
//! Mainnet, testnet and regtest differ in magic, ports, PoW limit, the
//! memory-hard PoW sizing, and difficulty policy (regtest does not
//! retarget).

use crate::pow::PowParams;
use crate::primitives::header::BlockHeader;
use crate::primitives::uint256::{compact_to_target, target_to_compact};
use crate::primitives::{Hash160, Hash256, U256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub default_rpc_port: u16,
    pub pow_limit: U256,
    pub pow_limit_bits: u32,
    /// Target block interval, seconds.
    pub target_spacing_secs: i64,
    /// ASERT half life, seconds.
    pub asert_half_life_secs: i64,
    /// Regtest: every block may use pow_limit bits.
    pub no_retargeting: bool,
    /// Chains below this total work are refused as sync targets during IBD.
    pub min_chain_work: U256,
    /// Per-network seed for the PoW epoch keys.
    pub chain_seed: [u8; 32],
    pub pow: PowParams,
    /// Consulted only when the address tables are empty and no anchors
    /// exist.
    pub fixed_seeds: &'static [&'static str],
    genesis_time: u32,
    genesis_nonce: u32,
}

const MAINNET_SEEDS: &[&str] = &[
    "seed1.coinbasechain.net:9590",
    "seed2.coinbasechain.net:9590",
    "seed3.coinbasechain.net:9590",
];

const TESTNET_SEEDS: &[&str] = &["testseed1.coinbasechain.net:19590"];

impl ChainParams {
    pub fn mainnet() -> Self {
        let pow_limit = pow_limit_from_bits(0x1d00ffff);
        ChainParams {
            network: Network::Mainnet,
            magic: [0xc0, 0xba, 0x5e, 0xc1],
            default_port: 9590,
            default_rpc_port: 9591,
            pow_limit,
            pow_limit_bits: 0x1d00ffff,
            target_spacing_secs: 600,
            asert_half_life_secs: 2 * 24 * 3600,
            no_retargeting: false,
            min_chain_work: U256::from_u64(0x0010_0000),
            chain_seed: *b"coinbasechain/main/pow-epoch-key",
            pow: PowParams {
                dataset_kib: 64 * 1024,
                mix_iters: 4096,
                reads_per_iter: 4,
                epoch_duration_secs: 86_400,
            },
            fixed_seeds: MAINNET_SEEDS,
            genesis_time: 1_735_689_600,
            genesis_nonce: 0,
        }
    }

    pub fn testnet() -> Self {
        let pow_limit = pow_limit_from_bits(0x1e00ffff);
        ChainParams {
            network: Network::Testnet,
            magic: [0xc0, 0xba, 0x5e, 0x7e],
            default_port: 19590,
            default_rpc_port: 19591,
            pow_limit,
            pow_limit_bits: 0x1e00ffff,
            target_spacing_secs: 600,
            asert_half_life_secs: 3600,
            no_retargeting: false,
            min_chain_work: U256::from_u64(0x1000),
            chain_seed: *b"coinbasechain/test/pow-epoch-key",
            pow: PowParams {
                dataset_kib: 16 * 1024,
                mix_iters: 1024,
                reads_per_iter: 4,
                epoch_duration_secs: 86_400,
            },
            fixed_seeds: TESTNET_SEEDS,
            genesis_time: 1_735_689_600,
            genesis_nonce: 0,
        }
    }

    pub fn regtest() -> Self {
        let pow_limit = pow_limit_from_bits(0x207fffff);
        ChainParams {
            network: Network::Regtest,
            magic: [0xc0, 0xba, 0x5e, 0x4e],
            default_port: 29590,
            default_rpc_port: 29591,
            pow_limit,
            pow_limit_bits: 0x207fffff,
            target_spacing_secs: 600,
            asert_half_life_secs: 3600,
            no_retargeting: true,
            min_chain_work: U256::ZERO,
            chain_seed: *b"coinbasechain/reg//pow-epoch-key",
            pow: PowParams {
                dataset_kib: 64,
                mix_iters: 8,
                reads_per_iter: 4,
                epoch_duration_secs: 86_400,
            },
            fixed_seeds: &[],
            genesis_time: 1_735_689_600,
            genesis_nonce: 0,
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// The genesis header. Installed through chainstate init only; its PoW
    /// commitment is all-zero and never FULL-verified.
    pub fn genesis_header(&self) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_id: Hash256::ZERO,
            miner: Hash160::ZERO,
            time: self.genesis_time,
            bits: self.pow_limit_bits,
            nonce: self.genesis_nonce,
            pow_commitment: Hash256::ZERO,
        }
    }

    pub fn genesis_id(&self) -> Hash256 {
        self.genesis_header().id()
    }
}

fn pow_limit_from_bits(bits: u32) -> U256 {
    // network constants are canonical by construction
    match compact_to_target(bits) {
        Ok(limit) => {
            debug_assert_eq!(target_to_compact(&limit), bits);
            limit
        }
        Err(_) => unreachable!("non-canonical pow limit constant"),
    }
}
