//! Reorganization across a healed partition (two nodes, more-work branch
//! wins, single tip notification during the switch).

mod common;

use coinbasechain::net::peer::{ConnType, Direction, PeerPermissions};
use coinbasechain::net::transport::memory_pair;
use common::{make_node, mine_chain, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partition_heal_adopts_heavier_branch() {
    // common history of 5 blocks, built on a and replayed into b
    let a = make_node();
    let b = make_node();
    let shared = mine_chain(&a, None, 5, 1);
    for header in &shared {
        assert!(b.chainstate.accept_header(header, None).is_accepted());
    }
    b.chainstate.activate_best_chain();
    assert_eq!(a.chainstate.tip().id, b.chainstate.tip().id);

    // partition: a mines 2, b mines 3 (strictly more cumulative work)
    let a_branch = mine_chain(&a, Some(shared[4]), 2, 2);
    let b_branch = mine_chain(&b, Some(shared[4]), 3, 3);
    assert_eq!(a.chainstate.tip().height, 7);
    assert_eq!(b.chainstate.tip().height, 8);

    let mut a_tip_events = a.chainstate.subscribe_tip();

    // heal the partition
    let (ta, tb) = memory_pair();
    a.connman
        .handle_inbound(ta, "10.0.0.2:40002".parse().unwrap());
    b.connman.spawn_peer(
        tb,
        "10.0.0.1:29590".parse().unwrap(),
        Direction::Outbound,
        ConnType::Full,
        PeerPermissions::default(),
    );

    // a switches to b's chain
    assert!(
        wait_until(
            || a.chainstate.tip().id == b_branch[2].id(),
            Duration::from_secs(5)
        )
        .await,
        "a did not adopt the heavier branch"
    );
    assert_eq!(a.chainstate.tip().height, 8);

    // active[6] on a is now b's block at height 6
    assert_eq!(
        a.chainstate.block_hash_at(6).unwrap(),
        b_branch[0].id()
    );
    // a's own stale branch is off the active chain but still indexed
    let stale = a.chainstate.header_info(&a_branch[1].id()).unwrap();
    assert!(!stale.on_active_chain);
    assert!(!stale.failed);

    // exactly one tip change fired during the switch
    let first = a_tip_events.try_recv().expect("one tip change");
    assert_eq!(first.id, b_branch[2].id());
    assert!(a_tip_events.try_recv().is_err(), "more than one tip change");

    // b keeps its tip: a's branch has strictly less work
    assert_eq!(b.chainstate.tip().id, b_branch[2].id());
}
