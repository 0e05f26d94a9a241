//! Header synchronization: locators, batched HEADERS, anti-DoS policing.
//!
//! During initial download one peer is the primary sync source; batches of
//! up to 2000 headers are pre-filtered (commitment-only PoW, continuity)
//! before any expensive work, then accepted one by one. Full batches pull
//! the next GETHEADERS; stalls and unconnecting batches rotate or
//! disconnect the peer.

use crate::chain::chainstate::{AcceptOutcome, ChainstateManager};
use crate::constants::{
    HEADER_SYNC_STALL_SECS, MAX_HEADERS_PER_MSG, MAX_UNCONNECTING_HEADERS, PENALTY_INVALID_HEADER,
    PENALTY_INVALID_POW, PENALTY_LOW_WORK, PENALTY_NON_CONTINUOUS, PENALTY_OVERSIZED,
    PENALTY_TOO_MANY_ORPHANS, PENALTY_UNCONNECTING, PROTOCOL_VERSION,
};
use crate::errors::{DoSError, ValidationError};
use crate::net::connman::ConnMan;
use crate::net::message::{GetHeadersMsg, InvItem, Message, INV_BLOCK};
use crate::net::peer::Peer;
use crate::primitives::header::BlockHeader;
use crate::primitives::Hash256;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Default)]
struct PeerSyncInfo {
    unconnecting: u32,
}

struct SyncState {
    sync_peer: Option<u64>,
    last_progress: Instant,
    per_peer: HashMap<u64, PeerSyncInfo>,
}

pub struct HeaderSync {
    chainstate: Arc<ChainstateManager>,
    state: Mutex<SyncState>,
}

impl HeaderSync {
    pub fn new(chainstate: Arc<ChainstateManager>) -> Self {
        Self {
            chainstate,
            state: Mutex::new(SyncState {
                sync_peer: None,
                last_progress: Instant::now(),
                per_peer: HashMap::new(),
            }),
        }
    }

    pub fn sync_peer(&self) -> Option<u64> {
        self.state.lock().sync_peer
    }

    fn send_getheaders(&self, peer: &Peer) {
        let locator = self.chainstate.locator();
        peer.send(Message::GetHeaders(GetHeadersMsg {
            version: PROTOCOL_VERSION,
            locator,
            stop: Hash256::ZERO,
        }));
    }

    /// Handshake completed: start pulling headers. During IBD the first
    /// ready peer becomes the primary sync source.
    pub fn on_peer_ready(&self, peer: &Arc<Peer>) {
        if self.chainstate.is_initial_download() {
            let mut st = self.state.lock();
            if st.sync_peer.is_none() {
                st.sync_peer = Some(peer.id);
                st.last_progress = Instant::now();
                info!(peer = peer.id, "selected header sync peer");
            } else if st.sync_peer != Some(peer.id) {
                return;
            }
        }
        self.send_getheaders(peer);
    }

    pub fn on_peer_gone(&self, peer_id: u64) {
        let mut st = self.state.lock();
        st.per_peer.remove(&peer_id);
        if st.sync_peer == Some(peer_id) {
            st.sync_peer = None;
        }
    }

    /// The HEADERS pipeline. Every gate runs before any expensive work.
    pub fn on_headers(&self, cm: &ConnMan, peer: &Arc<Peer>, headers: Vec<BlockHeader>) {
        if headers.is_empty() {
            // an empty response means the peer has nothing past our locator
            let mut st = self.state.lock();
            if st.sync_peer == Some(peer.id) {
                st.sync_peer = None;
                debug!(peer = peer.id, "peer reports no further headers");
            }
            return;
        }
        if headers.len() as u64 > MAX_HEADERS_PER_MSG {
            cm.punish(peer, PENALTY_OVERSIZED, "oversized headers batch");
            cm.disconnect_peer(peer, "oversized headers batch");
            return;
        }
        // cheap commitment-only pre-filter over the whole batch
        if let Err(err) = self.chainstate.check_headers_pow(&headers) {
            warn!(peer = peer.id, %err, "headers failed commitment pre-filter");
            cm.punish(peer, PENALTY_INVALID_POW, "headers fail pow pre-filter");
            cm.disconnect_peer(peer, "headers fail pow pre-filter");
            return;
        }
        // batches must be internally continuous
        for window in headers.windows(2) {
            if window[1].prev_id != window[0].id() {
                cm.punish(peer, PENALTY_NON_CONTINUOUS, "non-continuous headers");
                cm.disconnect_peer(peer, "non-continuous headers");
                return;
            }
        }
        // batches rooted at an unknown parent are pure orphan chains;
        // tolerate a few while we negotiate a fork point
        let connects = self.chainstate.contains_block(&headers[0].prev_id);
        if !connects {
            let count = {
                let mut st = self.state.lock();
                let info = st.per_peer.entry(peer.id).or_default();
                info.unconnecting += 1;
                info.unconnecting
            };
            debug!(peer = peer.id, count, "unconnecting headers batch");
            if count > MAX_UNCONNECTING_HEADERS {
                let reason = DoSError::TooManyUnconnecting.to_string();
                cm.punish(peer, PENALTY_UNCONNECTING, &reason);
                cm.disconnect_peer(peer, &reason);
                return;
            }
        } else {
            self.state.lock().per_peer.entry(peer.id).or_default().unconnecting = 0;
        }

        // FULL PoW on the worker pool, then the serial accept loop
        self.chainstate.prevalidate_pow_batch(&headers);
        let mut any_accepted = false;
        for header in &headers {
            match self.chainstate.accept_header(header, Some(peer.id)) {
                AcceptOutcome::Accepted => any_accepted = true,
                AcceptOutcome::Duplicate | AcceptOutcome::Orphaned => {}
                AcceptOutcome::Invalid(ValidationError::TimeTooNew) => {
                    // clock skew is not proof of lying; drop the rest of
                    // the batch without a penalty
                    break;
                }
                AcceptOutcome::Invalid(ValidationError::OrphanLimit) => {
                    cm.punish(peer, PENALTY_TOO_MANY_ORPHANS, &DoSError::TooManyOrphans.to_string());
                    return;
                }
                AcceptOutcome::Invalid(kind) => {
                    warn!(peer = peer.id, %kind, "invalid header from peer");
                    cm.punish(peer, PENALTY_INVALID_HEADER, "invalid header");
                    cm.disconnect_peer(peer, "invalid header");
                    return;
                }
                AcceptOutcome::Failed => return,
            }
        }
        self.chainstate.activate_best_chain();

        if any_accepted {
            let mut st = self.state.lock();
            st.last_progress = Instant::now();
        }

        if !connects {
            // ask again from our view of the chain to find the fork point
            self.send_getheaders(peer);
            return;
        }

        if headers.len() as u64 == MAX_HEADERS_PER_MSG {
            // probably more where that came from
            self.send_getheaders(peer);
        } else {
            self.on_batch_complete(cm, peer);
        }
    }

    /// A short batch: this peer has shown us its whole chain.
    fn on_batch_complete(&self, cm: &ConnMan, peer: &Arc<Peer>) {
        let ibd = self.chainstate.is_initial_download();
        if ibd {
            let tip = self.chainstate.tip();
            if tip.chain_work < self.chainstate.params().min_chain_work {
                cm.punish(peer, PENALTY_LOW_WORK, "chain below minimum work");
                self.rotate_sync_peer(cm, Some(peer.id));
                return;
            }
        }
        let mut st = self.state.lock();
        if st.sync_peer == Some(peer.id) {
            st.sync_peer = None;
            info!(peer = peer.id, "header sync caught up");
        }
    }

    /// A block announcement we do not recognize pulls headers.
    pub fn on_inv(&self, peer: &Arc<Peer>, items: &[InvItem]) {
        let unknown = items
            .iter()
            .any(|item| item.kind == INV_BLOCK && !self.chainstate.contains_block(&item.hash));
        if unknown {
            self.send_getheaders(peer);
        }
    }

    pub fn on_getheaders(&self, peer: &Arc<Peer>, msg: &GetHeadersMsg) {
        let headers = self.chainstate.headers_from_locator(
            &msg.locator,
            &msg.stop,
            MAX_HEADERS_PER_MSG as usize,
        );
        debug!(peer = peer.id, count = headers.len(), "serving getheaders");
        peer.send(Message::Headers(headers));
    }

    /// Announce a new tip to every ready peer.
    pub fn announce_tip(&self, cm: &ConnMan, tip: Hash256) {
        for peer in cm.ready_peers() {
            peer.send(Message::Inv(vec![InvItem {
                kind: INV_BLOCK,
                hash: tip,
            }]));
        }
    }

    /// Periodic upkeep: stall detection during IBD and sync-peer refill.
    pub fn maintain(&self, cm: &ConnMan) {
        if !self.chainstate.is_initial_download() {
            return;
        }
        let stalled = {
            let st = self.state.lock();
            match st.sync_peer {
                Some(id) => {
                    if st.last_progress.elapsed() > Duration::from_secs(HEADER_SYNC_STALL_SECS) {
                        Some(id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(id) = stalled {
            if let Some(peer) = cm.get_peer(id) {
                warn!(peer = id, "header sync stalled; switching peers");
                cm.disconnect_peer(&peer, "header sync stalled");
            }
            self.rotate_sync_peer(cm, Some(id));
            return;
        }
        if self.state.lock().sync_peer.is_none() {
            self.rotate_sync_peer(cm, None);
        }
    }

    fn rotate_sync_peer(&self, cm: &ConnMan, exclude: Option<u64>) {
        let next = cm
            .ready_peers()
            .into_iter()
            .find(|p| Some(p.id) != exclude);
        let mut st = self.state.lock();
        match next {
            Some(peer) => {
                st.sync_peer = Some(peer.id);
                st.last_progress = Instant::now();
                drop(st);
                info!(peer = peer.id, "rotated header sync peer");
                self.send_getheaders(&peer);
            }
            None => {
                st.sync_peer = None;
            }
        }
    }
}
