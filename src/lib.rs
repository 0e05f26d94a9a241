//! CoinbaseChain: a headers-only proof-of-work blockchain node.
//!
//! The ledger is the header chain itself. The node validates and selects
//! among competing header chains (memory-hard PoW, ASERT difficulty,
//! orphan management, reorgs) and synchronizes with untrusted peers over
//! a framed binary protocol with strict resource caps.

pub mod chain;
pub mod config;
pub mod consensus;
pub mod constants;
pub mod errors;
pub mod metrics;
pub mod net;
pub mod node;
pub mod pow;
pub mod primitives;
pub mod rpc;
pub mod timedata;
