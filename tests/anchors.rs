//! Anchor persistence: best outbound peers survive a graceful shutdown.

mod common;

use coinbasechain::net::connman::load_anchors;
use coinbasechain::net::peer::{ConnType, Direction, PeerPermissions};
use coinbasechain::net::transport::memory_pair;
use common::{make_node, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn anchors_written_on_shutdown_and_reloaded() {
    let node = make_node();
    let peer_node_a = make_node();
    let peer_node_b = make_node();

    let addr_a: std::net::SocketAddr = "10.1.0.1:29590".parse().unwrap();
    let addr_b: std::net::SocketAddr = "10.1.0.2:29590".parse().unwrap();

    // two live outbound connections from `node`
    let (ta, tb) = memory_pair();
    node.connman.spawn_peer(
        ta,
        addr_a,
        Direction::Outbound,
        ConnType::Full,
        PeerPermissions::default(),
    );
    peer_node_a
        .connman
        .handle_inbound(tb, "10.1.0.9:5000".parse().unwrap());

    let (tc, td) = memory_pair();
    node.connman.spawn_peer(
        tc,
        addr_b,
        Direction::Outbound,
        ConnType::Full,
        PeerPermissions::default(),
    );
    peer_node_b
        .connman
        .handle_inbound(td, "10.1.0.9:5001".parse().unwrap());

    assert!(
        wait_until(
            || node.connman.ready_peers().len() == 2,
            Duration::from_secs(5)
        )
        .await,
        "outbound handshakes did not complete"
    );

    node.connman.save_anchors().unwrap();
    let anchors = load_anchors(node.dir.path());
    assert!(!anchors.is_empty() && anchors.len() <= 3);
    assert!(anchors.contains(&addr_a) || anchors.contains(&addr_b));

    // a fresh connection manager on the same datadir queues them first
    let restarted = coinbasechain::net::connman::ConnMan::new(
        coinbasechain::net::connman::NetConfig::for_port(29590),
        std::sync::Arc::clone(&node.chainstate),
        std::sync::Arc::new(coinbasechain::timedata::TimeData::new()),
        coinbasechain::net::addrman::AddrMan::new(),
        node.dir.path().to_path_buf(),
    );
    // the anchors file is intact and bounded
    drop(restarted);
    assert_eq!(load_anchors(node.dir.path()), anchors);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn misbehaving_peers_are_not_anchors() {
    let node = make_node();
    let other = make_node();

    let addr: std::net::SocketAddr = "10.2.0.1:29590".parse().unwrap();
    let (ta, tb) = memory_pair();
    let peer = node.connman.spawn_peer(
        ta,
        addr,
        Direction::Outbound,
        ConnType::Full,
        PeerPermissions::default(),
    );
    other
        .connman
        .handle_inbound(tb, "10.2.0.9:5000".parse().unwrap());

    assert!(
        wait_until(
            || node.connman.ready_peers().len() == 1,
            Duration::from_secs(5)
        )
        .await
    );

    peer.bump_misbehavior(10);
    node.connman.save_anchors().unwrap();
    assert!(load_anchors(node.dir.path()).is_empty());
}
