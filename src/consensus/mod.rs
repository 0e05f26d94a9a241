//! Consensus rules: chain parameters and the difficulty schedule.

pub mod difficulty;
pub mod params;

pub use difficulty::{next_bits_asert, AsertAnchor};
pub use params::{ChainParams, Network};
