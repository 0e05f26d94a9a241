#![allow(dead_code)]
//! Shared helpers for the simulated-network integration tests.
//!
//! Nodes are real chainstate + connection-manager stacks wired together
//! over in-memory duplex transports; no sockets, no timers needed.

use coinbasechain::chain::chainstate::ChainstateManager;
use coinbasechain::consensus::params::ChainParams;
use coinbasechain::net::connman::{ConnMan, NetConfig};
use coinbasechain::net::message::Message;
use coinbasechain::net::wire::{encode_frame, FrameHeader, FRAME_HEADER_SIZE};
use coinbasechain::pow::PowEngine;
use coinbasechain::primitives::header::BlockHeader;
use coinbasechain::primitives::{Hash160, Hash256};
use coinbasechain::timedata::{unix_now, TimeData};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct TestNode {
    pub chainstate: Arc<ChainstateManager>,
    pub connman: Arc<ConnMan>,
    pub dir: TempDir,
}

pub fn make_node() -> TestNode {
    let params = Arc::new(ChainParams::regtest());
    let pow = Arc::new(PowEngine::new(params.pow, params.chain_seed));
    let timedata = Arc::new(TimeData::new());
    let chainstate = Arc::new(ChainstateManager::new(
        Arc::clone(&params),
        pow,
        timedata.clone(),
    ));
    let dir = TempDir::new().expect("tempdir");
    let connman = ConnMan::new(
        NetConfig::for_port(29590),
        Arc::clone(&chainstate),
        timedata,
        coinbasechain::net::addrman::AddrMan::new(),
        dir.path().to_path_buf(),
    );
    TestNode {
        chainstate,
        connman,
        dir,
    }
}

/// Mine, accept and activate `n` headers on top of `base` (or the tip of
/// the node's chain when `base` is None).
pub fn mine_chain(
    node: &TestNode,
    base: Option<BlockHeader>,
    n: usize,
    miner_tag: u8,
) -> Vec<BlockHeader> {
    let mut prev = base.unwrap_or_else(|| {
        let tip = node.chainstate.tip();
        node.chainstate
            .header_info(&tip.id)
            .expect("tip indexed")
            .header
    });
    let mut out = Vec::new();
    let start = unix_now() as u32;
    for i in 0..n {
        let mut header = BlockHeader {
            version: 1,
            prev_id: prev.id(),
            miner: Hash160([miner_tag; 20]),
            time: start.max(prev.time) + i as u32 + 1,
            bits: node.chainstate.params().pow_limit_bits,
            nonce: 0,
            pow_commitment: Hash256::ZERO,
        };
        node.chainstate
            .pow()
            .mine_header(&mut header)
            .expect("regtest mining");
        assert!(
            node.chainstate.accept_header(&header, None).is_accepted(),
            "mined header rejected"
        );
        out.push(header);
        prev = header;
    }
    node.chainstate.activate_best_chain();
    out
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

// ---- raw protocol client for adversarial tests ----

pub async fn write_message<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    magic: &[u8; 4],
    msg: &Message,
) {
    let frame = encode_frame(magic, msg.command(), &msg.encode_payload());
    stream.write_all(&frame).await.expect("write frame");
}

pub async fn write_raw_frame<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    magic: &[u8; 4],
    command: &str,
    payload: &[u8],
) {
    let frame = encode_frame(magic, command, payload);
    stream.write_all(&frame).await.expect("write frame");
}

pub async fn read_message<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    magic: &[u8; 4],
) -> Message {
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    stream
        .read_exact(&mut header_bytes)
        .await
        .expect("read frame header");
    let frame = FrameHeader::decode(&header_bytes, magic).expect("frame header");
    let mut payload = vec![0u8; frame.length as usize];
    stream.read_exact(&mut payload).await.expect("read payload");
    let command = frame.command_str().expect("command tag");
    Message::decode(command, &payload).expect("payload decode")
}

/// Perform the VERSION/VERACK dance from the attacker's side of an
/// inbound connection.
pub async fn raw_handshake<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    magic: &[u8; 4],
) {
    use coinbasechain::net::message::{NetAddress, VersionMsg};
    let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let version = Message::Version(VersionMsg {
        version: 1,
        services: 1,
        timestamp: unix_now() as i64,
        receiver: NetAddress::from_socket(&addr, 0),
        sender: NetAddress::from_socket(&addr, 1),
        nonce: rand_nonce(),
        user_agent: "/rawclient:0.0.1/".into(),
        start_height: 0,
        relay: true,
    });
    write_message(stream, magic, &version).await;
    // expect the node's version, then its verack
    let mut got_version = false;
    let mut got_verack = false;
    while !(got_version && got_verack) {
        match read_message(stream, magic).await {
            Message::Version(_) => got_version = true,
            Message::Verack => got_verack = true,
            other => panic!("unexpected handshake message: {other:?}"),
        }
    }
    write_message(stream, magic, &Message::Verack).await;
}

fn rand_nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(7)
        | 1
}

/// An orphan chain rooted at a parent the victim has never heard of. The
/// commitments are zero: they pass the commitment-only pre-filter but
/// would never survive FULL verification.
pub fn orphan_chain(bits: u32, len: usize) -> Vec<BlockHeader> {
    let mut out = Vec::new();
    let mut prev = Hash256([0xab; 32]);
    let start = unix_now() as u32;
    for i in 0..len {
        let header = BlockHeader {
            version: 1,
            prev_id: prev,
            miner: Hash160::ZERO,
            time: start + i as u32,
            bits,
            nonce: i as u32,
            pow_commitment: Hash256::ZERO,
        };
        prev = header.id();
        out.push(header);
    }
    out
}
