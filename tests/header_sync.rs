//! Happy-path header synchronization over the simulated network.

mod common;

use coinbasechain::net::peer::{ConnType, Direction, PeerPermissions};
use coinbasechain::net::transport::memory_pair;
use common::{make_node, mine_chain, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_syncs_ten_headers_from_peer() {
    let a = make_node();
    let chain = mine_chain(&a, None, 10, 1);
    assert_eq!(a.chainstate.tip().height, 10);

    let b = make_node();
    assert!(b.chainstate.is_initial_download());

    let (ta, tb) = memory_pair();
    a.connman
        .handle_inbound(ta, "10.0.0.2:40000".parse().unwrap());
    b.connman.spawn_peer(
        tb,
        "10.0.0.1:29590".parse().unwrap(),
        Direction::Outbound,
        ConnType::Full,
        PeerPermissions::default(),
    );

    let synced = wait_until(
        || b.chainstate.tip().id == chain[9].id(),
        Duration::from_secs(5),
    )
    .await;
    assert!(synced, "b never reached a's tip");
    assert_eq!(b.chainstate.tip().height, 10);
    assert_eq!(b.chainstate.tip().id, a.chainstate.tip().id);

    // both sides remain connected and ready
    let both_ready = wait_until(
        || a.connman.ready_peers().len() == 1 && b.connman.ready_peers().len() == 1,
        Duration::from_secs(2),
    )
    .await;
    assert!(both_ready, "handshake did not settle on both sides");

    // catching up ends initial download on the syncing node
    assert!(!b.chainstate.is_initial_download());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_blocks_propagate_via_inv() {
    let a = make_node();
    mine_chain(&a, None, 3, 1);
    let b = make_node();

    let (ta, tb) = memory_pair();
    a.connman
        .handle_inbound(ta, "10.0.0.2:40001".parse().unwrap());
    b.connman.spawn_peer(
        tb,
        "10.0.0.1:29590".parse().unwrap(),
        Direction::Outbound,
        ConnType::Full,
        PeerPermissions::default(),
    );

    assert!(
        wait_until(
            || b.chainstate.tip().height == 3,
            Duration::from_secs(5)
        )
        .await
    );

    // a extends its chain and announces the new tip
    let new_blocks = mine_chain(&a, None, 2, 1);
    a.connman
        .sync
        .announce_tip(&a.connman, new_blocks[1].id());

    assert!(
        wait_until(
            || b.chainstate.tip().id == new_blocks[1].id(),
            Duration::from_secs(5)
        )
        .await,
        "inv announcement did not pull the new blocks"
    );
}
