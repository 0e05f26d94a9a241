//! Chainstate manager: header acceptance, chain selection, invalidation.
//!
//! All headers (from peers, RPC, or the header store) go through
//! `accept_header`; it is the only path that adds entries to the block
//! index. One coarse lock protects the index, active chain, candidate set,
//! orphan pool and failed cache. `activate_best_chain` releases the lock
//! between 32-block batches so message handling can interleave with a deep
//! reorg. Notifications are published only after the lock is released.

use crate::chain::index::{ActiveChain, BlockIndex, BlockIndexEntry, BlockStatus, EntryId};
use crate::chain::notify::{ChainNotifier, TipChange};
use crate::chain::orphans::{OrphanInsert, OrphanPool};
use crate::consensus::difficulty::{next_bits_asert, AsertAnchor};
use crate::consensus::params::ChainParams;
use crate::constants::{
    ACTIVATION_BATCH, MAX_FAILED_CACHE, MAX_FUTURE_DRIFT_SECS, MAX_LOCATOR_HASHES,
};
use crate::errors::{NodeError, NodeResult, PowError, ValidationError};
use crate::pow::PowEngine;
use crate::primitives::header::BlockHeader;
use crate::primitives::uint256::{compact_to_target, work_from_target};
use crate::primitives::{Hash256, U256};
use crate::timedata::{unix_now, TimeData};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Peer id used for headers submitted locally (RPC, store reload).
pub const LOCAL_PEER: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    Orphaned,
    Duplicate,
    Invalid(ValidationError),
    Failed,
}

impl AcceptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptOutcome::Accepted)
    }
}

/// Snapshot of the current tip.
#[derive(Debug, Clone, Copy)]
pub struct TipInfo {
    pub id: Hash256,
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    pub chain_work: U256,
}

/// Snapshot of one indexed header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderInfo {
    pub header: BlockHeader,
    pub id: Hash256,
    pub height: u32,
    pub chain_work: U256,
    pub on_active_chain: bool,
    pub failed: bool,
    pub failed_child: bool,
}

/// Insertion-ordered bounded id set.
struct BoundedIdSet {
    set: HashSet<Hash256>,
    order: VecDeque<Hash256>,
    cap: usize,
}

impl BoundedIdSet {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, id: Hash256) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    fn remove(&mut self, id: &Hash256) -> bool {
        if self.set.remove(id) {
            self.order.retain(|o| o != id);
            true
        } else {
            false
        }
    }

    fn contains(&self, id: &Hash256) -> bool {
        self.set.contains(id)
    }
}

struct ChainState {
    index: BlockIndex,
    active: ActiveChain,
    candidates: Vec<EntryId>,
    orphans: OrphanPool,
    failed_cache: BoundedIdSet,
    /// FULL-PoW results precomputed off-lock for incoming batches.
    pow_valid: BoundedIdSet,
}

pub struct ChainstateManager {
    params: Arc<ChainParams>,
    pow: Arc<PowEngine>,
    timedata: Arc<TimeData>,
    notifier: ChainNotifier,
    state: Mutex<ChainState>,
    ibd_done: AtomicBool,
}

impl ChainstateManager {
    /// Create a manager with the configured genesis installed. Genesis is
    /// never submitted through `accept_header`.
    pub fn new(params: Arc<ChainParams>, pow: Arc<PowEngine>, timedata: Arc<TimeData>) -> Self {
        let genesis = params.genesis_header();
        let genesis_target = params.pow_limit;
        let mut index = BlockIndex::new();
        let mut active = ActiveChain::new();
        let e = index.insert(BlockIndexEntry {
            id: genesis.id(),
            header: genesis,
            height: 0,
            parent: None,
            chain_work: work_from_target(&genesis_target),
            status: BlockStatus::with_header_valid(),
            time_received: unix_now(),
        });
        active.push(&index, e);
        Self {
            params,
            pow,
            timedata,
            notifier: ChainNotifier::new(),
            state: Mutex::new(ChainState {
                index,
                active,
                candidates: Vec::new(),
                orphans: OrphanPool::new(),
                failed_cache: BoundedIdSet::new(MAX_FAILED_CACHE),
                pow_valid: BoundedIdSet::new(4096),
            }),
            ibd_done: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn pow(&self) -> &PowEngine {
        &self.pow
    }

    pub fn subscribe_tip(&self) -> broadcast::Receiver<TipChange> {
        self.notifier.subscribe()
    }

    /// Accept one header. On success, orphans waiting for it are drained
    /// recursively before this returns.
    pub fn accept_header(&self, header: &BlockHeader, peer: Option<u64>) -> AcceptOutcome {
        let now_adjusted = self.timedata.adjusted_time();
        let mut st = self.state.lock();
        let outcome = self.accept_inner(&mut st, header, peer, now_adjusted);
        if outcome.is_accepted() {
            self.drain_orphans(&mut st, header.id(), now_adjusted);
        }
        outcome
    }

    fn accept_inner(
        &self,
        st: &mut ChainState,
        header: &BlockHeader,
        peer: Option<u64>,
        now_adjusted: u64,
    ) -> AcceptOutcome {
        let id = header.id();

        // 1: known-bad ids never get expensive work
        if st.failed_cache.contains(&id) {
            return AcceptOutcome::Invalid(ValidationError::CachedFail);
        }
        // 2: idempotence
        if st.index.contains(&id) {
            return AcceptOutcome::Duplicate;
        }
        // 3: the configured genesis is installed at init and lands in step
        // 2; any other parentless header is a fake genesis
        if header.prev_id.is_zero() {
            return AcceptOutcome::Invalid(ValidationError::BadGenesis);
        }
        // 4: unknown parent -> orphan cache
        let parent = match st.index.lookup(&header.prev_id) {
            Some(p) => p,
            None => {
                let from = peer.unwrap_or(LOCAL_PEER);
                return match st.orphans.insert(*header, from, unix_now()) {
                    OrphanInsert::Added | OrphanInsert::AlreadyKnown => AcceptOutcome::Orphaned,
                    OrphanInsert::PerPeerLimit => {
                        AcceptOutcome::Invalid(ValidationError::OrphanLimit)
                    }
                };
            }
        };
        // 5: children of invalid blocks are invalid
        if st.index.get(parent).status.is_invalid() {
            st.failed_cache.insert(id);
            return AcceptOutcome::Invalid(ValidationError::BadPrev);
        }
        // 6: context-free checks
        if header.version < 1 {
            st.failed_cache.insert(id);
            return AcceptOutcome::Invalid(ValidationError::BadVersion);
        }
        let target = match compact_to_target(header.bits) {
            Ok(t) if t <= self.params.pow_limit => t,
            _ => {
                st.failed_cache.insert(id);
                return AcceptOutcome::Invalid(ValidationError::BadDifficulty);
            }
        };
        let mtp = st.index.median_time_past(parent);
        if header.time <= mtp {
            st.failed_cache.insert(id);
            return AcceptOutcome::Invalid(ValidationError::TimeTooOld);
        }
        if header.time as u64 > now_adjusted + MAX_FUTURE_DRIFT_SECS {
            // clock-dependent, not final: do not cache
            return AcceptOutcome::Invalid(ValidationError::TimeTooNew);
        }
        // 7: FULL proof of work
        let preverified = st.pow_valid.remove(&id);
        if !preverified {
            if let Err(err) = self.pow.verify_full(header) {
                debug!(block = %id, %err, "full pow verification failed");
                st.failed_cache.insert(id);
                return AcceptOutcome::Invalid(ValidationError::BadPoW);
            }
        }
        // 8: contextual difficulty
        let height = st.index.get(parent).height + 1;
        match self.expected_bits(st, parent, height, header.time) {
            Ok(expected) if expected == header.bits => {}
            _ => {
                st.failed_cache.insert(id);
                return AcceptOutcome::Invalid(ValidationError::BadDifficulty);
            }
        }
        // 9 + 10: install
        let chain_work = st
            .index
            .get(parent)
            .chain_work
            .saturating_add(&work_from_target(&target));
        let e = st.index.insert(BlockIndexEntry {
            id,
            header: *header,
            height,
            parent: Some(parent),
            chain_work,
            status: BlockStatus::with_header_valid(),
            time_received: unix_now(),
        });
        // 12: chain-selection candidate
        Self::offer_candidate(st, e);
        crate::metrics::HEADERS_ACCEPTED.inc();
        debug!(block = %id, height, "header accepted");
        AcceptOutcome::Accepted
    }

    /// Expected compact bits for a header at `height` extending `parent`.
    /// Heights 0 and 1 (and all of regtest) use the PoW limit; everything
    /// later follows ASERT from the branch's height-1 anchor.
    fn expected_bits(
        &self,
        st: &ChainState,
        parent: EntryId,
        height: u32,
        time: u32,
    ) -> Result<u32, PowError> {
        if self.params.no_retargeting || height <= 1 {
            return Ok(self.params.pow_limit_bits);
        }
        let anchor = st
            .index
            .ancestor(parent, 1)
            .ok_or(PowError::NonCanonicalTarget)?;
        let anchor = st.index.get(anchor);
        next_bits_asert(
            &AsertAnchor {
                height: 1,
                bits: anchor.header.bits,
                time: anchor.header.time as i64,
            },
            height as i64,
            time as i64,
            &self.params,
        )
    }

    /// Step 11: re-enter accept for every cached orphan whose parent just
    /// arrived. Each drained orphan leaves the pool before its own children
    /// are considered, so the total strictly decreases.
    fn drain_orphans(&self, st: &mut ChainState, installed: Hash256, now_adjusted: u64) {
        let mut worklist = vec![installed];
        while let Some(parent_id) = worklist.pop() {
            for orphan in st.orphans.take_children(&parent_id) {
                let child_id = orphan.header.id();
                match self.accept_inner(st, &orphan.header, Some(orphan.peer), now_adjusted) {
                    AcceptOutcome::Accepted => worklist.push(child_id),
                    outcome => {
                        debug!(block = %child_id, ?outcome, "drained orphan not accepted")
                    }
                }
            }
        }
    }

    fn offer_candidate(st: &mut ChainState, e: EntryId) {
        let tip = match st.active.tip() {
            Some(t) => t,
            None => return,
        };
        let tip_work = st.index.get(tip).chain_work;
        let entry = st.index.get(e);
        if entry.status.is_invalid() || !entry.status.is_valid_header() {
            return;
        }
        if e != tip && entry.chain_work >= tip_work && !st.candidates.contains(&e) {
            st.candidates.push(e);
        }
    }

    fn prune_candidates(st: &mut ChainState) {
        let tip = match st.active.tip() {
            Some(t) => t,
            None => return,
        };
        let tip_work = st.index.get(tip).chain_work;
        let ChainState {
            index, candidates, ..
        } = st;
        candidates.retain(|&c| {
            let e = index.get(c);
            c != tip && !e.status.is_invalid() && e.chain_work >= tip_work
        });
    }

    /// Best candidate strictly better than the tip: maximum work, ties to
    /// the earlier-seen entry, then the lexicographically smaller id.
    fn best_candidate(st: &ChainState) -> Option<EntryId> {
        let tip = st.active.tip()?;
        let tip_work = st.index.get(tip).chain_work;
        let mut best: Option<EntryId> = None;
        for &c in &st.candidates {
            let e = st.index.get(c);
            if e.chain_work <= tip_work {
                continue;
            }
            best = match best {
                None => Some(c),
                Some(b) => {
                    let cur = st.index.get(b);
                    let better = match e.chain_work.cmp(&cur.chain_work) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => {
                            match e.time_received.cmp(&cur.time_received) {
                                std::cmp::Ordering::Less => true,
                                std::cmp::Ordering::Greater => false,
                                std::cmp::Ordering::Equal => e.id < cur.id,
                            }
                        }
                    };
                    if better {
                        Some(c)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    /// Drive the active chain toward the best candidate. Connects at most
    /// `ACTIVATION_BATCH` blocks per lock acquisition. Returns true if the
    /// tip changed; a single tip notification is published at the end.
    pub fn activate_best_chain(&self) -> bool {
        let mut tip_changed = false;
        let mut final_tip: Option<TipChange> = None;
        loop {
            let mut progressed = false;
            {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                Self::prune_candidates(st);
                let best = match Self::best_candidate(st) {
                    Some(b) => b,
                    None => break,
                };
                let tip = match st.active.tip() {
                    Some(t) => t,
                    None => break,
                };
                let fork = match st.index.last_common_ancestor(tip, best) {
                    Some(f) => f,
                    None => {
                        // disjoint history; drop the candidate
                        warn!("candidate does not share history with the active chain");
                        st.candidates.retain(|&c| c != best);
                        continue;
                    }
                };
                // disconnect: in a headers-only chain this is trimming the
                // height vector; the old tip stays a candidate
                if fork != tip {
                    let fork_height = st.index.get(fork).height;
                    st.active.truncate_to(fork_height);
                    Self::offer_candidate(st, tip);
                    crate::metrics::REORGS.inc();
                }
                // connect toward the target in one bounded batch
                let mut path = Vec::new();
                let mut cursor = best;
                while cursor != fork {
                    path.push(cursor);
                    cursor = match st.index.get(cursor).parent {
                        Some(p) => p,
                        None => break,
                    };
                }
                path.reverse();
                let reached_target = path.len() <= ACTIVATION_BATCH;
                for &e in path.iter().take(ACTIVATION_BATCH) {
                    st.active.push(&st.index, e);
                }
                if reached_target {
                    st.candidates.retain(|&c| c != best);
                }
                Self::prune_candidates(st);
                if let Some(new_tip) = st.active.tip() {
                    let entry = st.index.get(new_tip);
                    final_tip = Some(TipChange {
                        id: entry.id,
                        height: entry.height,
                        time: entry.header.time,
                    });
                    info!(tip = %entry.id, height = entry.height, "active chain updated");
                }
                tip_changed = true;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        if tip_changed {
            if let Some(change) = final_tip {
                self.notifier.publish(change);
            }
        }
        tip_changed
    }

    /// Mark a subtree invalid and rewind the tip beneath it. Does not
    /// re-activate; the caller (or the next accepted header) does.
    pub fn invalidate(&self, id: &Hash256) -> NodeResult<()> {
        let mut st = self.state.lock();
        let e = st
            .index
            .lookup(id)
            .ok_or_else(|| NodeError::Config(format!("unknown block {id}")))?;
        if st.index.get(e).height <= 1 {
            return Err(NodeError::Config(
                "cannot invalidate genesis or the difficulty anchor".into(),
            ));
        }
        st.index.get_mut(e).status.set_failed();
        st.failed_cache.insert(*id);

        // arena order has parents before children: one pass marks every
        // descendant of a failed block
        for i in 0..st.index.len() {
            if let Some(p) = st.index.get(i).parent {
                if st.index.get(p).status.is_invalid() && !st.index.get(i).status.is_invalid() {
                    st.index.get_mut(i).status.set_failed_child();
                }
            }
        }

        if st.active.contains(&st.index, e) {
            let new_tip_height = st.index.get(e).height - 1;
            st.active.truncate_to(new_tip_height);
            info!(block = %id, new_height = new_tip_height, "tip rewound below invalidated block");
        }

        // rebuild the candidate set from scratch
        let tip = st.active.tip();
        let tip_work = tip.map(|t| st.index.get(t).chain_work).unwrap_or(U256::ZERO);
        let ChainState {
            index,
            active,
            candidates,
            ..
        } = &mut *st;
        candidates.clear();
        for (i, entry) in index.iter() {
            if Some(i) != tip
                && entry.status.is_valid_header()
                && !entry.status.is_invalid()
                && entry.chain_work >= tip_work
                && !active.contains(index, i)
            {
                candidates.push(i);
            }
        }
        Ok(())
    }

    /// Clear failure flags from a block, its ancestors and its subtree, and
    /// offer the revived entries as candidates again.
    pub fn reconsider(&self, id: &Hash256) -> NodeResult<()> {
        let mut st = self.state.lock();
        let e = st
            .index
            .lookup(id)
            .ok_or_else(|| NodeError::Config(format!("unknown block {id}")))?;

        // ancestors, so the revived branch connects all the way down
        let mut cursor = Some(e);
        while let Some(c) = cursor {
            let cid = st.index.get(c).id;
            st.index.get_mut(c).status.clear_failure();
            st.failed_cache.remove(&cid);
            cursor = st.index.get(c).parent;
        }
        // subtree, by arena order
        let mut revived: HashSet<EntryId> = HashSet::new();
        revived.insert(e);
        for i in 0..st.index.len() {
            if let Some(p) = st.index.get(i).parent {
                if revived.contains(&p) {
                    let iid = st.index.get(i).id;
                    st.index.get_mut(i).status.clear_failure();
                    st.failed_cache.remove(&iid);
                    revived.insert(i);
                }
            }
        }
        for i in revived {
            Self::offer_candidate(&mut st, i);
        }
        Ok(())
    }

    /// COMMITMENT_ONLY pre-filter over a batch; cheap, no lock.
    pub fn check_headers_pow(&self, batch: &[BlockHeader]) -> Result<(), PowError> {
        for h in batch {
            PowEngine::check_commitment(h)?;
        }
        Ok(())
    }

    /// FULL-verify a batch on the worker pool (off-lock) and stash the
    /// passing ids so `accept_header` skips the recomputation.
    pub fn prevalidate_pow_batch(&self, batch: &[BlockHeader]) {
        let unknown: Vec<BlockHeader> = {
            let st = self.state.lock();
            batch
                .iter()
                .filter(|h| !st.index.contains(&h.id()))
                .copied()
                .collect()
        };
        if unknown.is_empty() {
            return;
        }
        let results = self.pow.verify_full_batch(&unknown);
        let mut st = self.state.lock();
        for (id, res) in results {
            if res.is_ok() {
                st.pow_valid.insert(id);
            }
        }
    }

    /// True until the tip is recent and carries the minimum work; latches
    /// false permanently.
    pub fn is_initial_download(&self) -> bool {
        if self.ibd_done.load(Ordering::Relaxed) {
            return false;
        }
        let (tip_time, tip_work) = {
            let st = self.state.lock();
            let tip = match st.active.tip() {
                Some(t) => t,
                None => return true,
            };
            let e = st.index.get(tip);
            (e.header.time as u64, e.chain_work)
        };
        let now = self.timedata.adjusted_time();
        let max_age = self.params.target_spacing_secs.max(0) as u64 * 3;
        if tip_time + max_age < now {
            return true;
        }
        if tip_work < self.params.min_chain_work {
            return true;
        }
        self.ibd_done.store(true, Ordering::Relaxed);
        false
    }

    // ---- queries (each takes and releases the lock) ----

    pub fn tip(&self) -> TipInfo {
        let st = self.state.lock();
        let tip = st.active.tip().unwrap_or(0);
        let e = st.index.get(tip);
        TipInfo {
            id: e.id,
            height: e.height,
            time: e.header.time,
            bits: e.header.bits,
            chain_work: e.chain_work,
        }
    }

    pub fn block_hash_at(&self, height: u32) -> Option<Hash256> {
        let st = self.state.lock();
        st.active.at(height).map(|e| st.index.get(e).id)
    }

    pub fn header_info(&self, id: &Hash256) -> Option<HeaderInfo> {
        let st = self.state.lock();
        let e = st.index.lookup(id)?;
        let entry = st.index.get(e);
        Some(HeaderInfo {
            header: entry.header,
            id: entry.id,
            height: entry.height,
            chain_work: entry.chain_work,
            on_active_chain: st.active.contains(&st.index, e),
            failed: entry.status.is_failed(),
            failed_child: entry.status.is_failed_child(),
        })
    }

    pub fn contains_block(&self, id: &Hash256) -> bool {
        self.state.lock().index.contains(id)
    }

    pub fn header_count(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphans.len()
    }

    pub fn orphan_count_for_peer(&self, peer: u64) -> usize {
        self.state.lock().orphans.peer_count(peer)
    }

    pub fn expire_orphans(&self) {
        self.state.lock().orphans.expire(unix_now());
    }

    pub fn genesis_id(&self) -> Hash256 {
        self.params.genesis_id()
    }

    /// Exponentially spaced locator over the active chain, capped.
    pub fn locator(&self) -> Vec<Hash256> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let tip_height = match st.active.height() {
            Some(h) => h,
            None => return out,
        };
        let mut height = tip_height as i64;
        let mut step: i64 = 1;
        while height > 0 {
            if let Some(e) = st.active.at(height as u32) {
                out.push(st.index.get(e).id);
            }
            if out.len() >= 10 {
                step *= 2;
            }
            if out.len() as u64 >= MAX_LOCATOR_HASHES - 1 {
                break;
            }
            height -= step;
        }
        if let Some(genesis) = st.active.at(0) {
            out.push(st.index.get(genesis).id);
        }
        out
    }

    /// Serve a GETHEADERS request: headers on the active chain after the
    /// highest locator entry we share, up to `max` or the stop hash.
    pub fn headers_from_locator(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        max: usize,
    ) -> Vec<BlockHeader> {
        let st = self.state.lock();
        let mut start_height = 1u32;
        for id in locator {
            if let Some(e) = st.index.lookup(id) {
                if st.active.contains(&st.index, e) {
                    start_height = st.index.get(e).height + 1;
                    break;
                }
            }
        }
        let mut out = Vec::new();
        let tip_height = match st.active.height() {
            Some(h) => h,
            None => return out,
        };
        for h in start_height..=tip_height {
            let e = match st.active.at(h) {
                Some(e) => e,
                None => break,
            };
            let entry = st.index.get(e);
            out.push(entry.header);
            if out.len() >= max || entry.id == *stop {
                break;
            }
        }
        out
    }

    /// Every indexed header except genesis, parents before children. The
    /// header store persists exactly this.
    pub fn headers_for_store(&self) -> Vec<BlockHeader> {
        let st = self.state.lock();
        st.index
            .iter()
            .filter(|(_, e)| e.height > 0)
            .map(|(_, e)| e.header)
            .collect()
    }
}
