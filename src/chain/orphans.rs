//! Orphan header pool: headers whose parent is not yet in the block index.
//!
//! Bounded three ways: total count, per-peer count, and age. A header is
//! either here or in the block index, never both.

use crate::constants::{MAX_ORPHANS_PER_PEER, MAX_ORPHAN_HEADERS, ORPHAN_TTL_SECS};
use crate::primitives::header::BlockHeader;
use crate::primitives::Hash256;
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone)]
pub struct OrphanEntry {
    pub header: BlockHeader,
    pub time_received: u64,
    pub peer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanInsert {
    Added,
    AlreadyKnown,
    PerPeerLimit,
}

#[derive(Default)]
pub struct OrphanPool {
    by_id: HashMap<Hash256, OrphanEntry>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    per_peer: HashMap<u64, usize>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn peer_count(&self, peer: u64) -> usize {
        self.per_peer.get(&peer).copied().unwrap_or(0)
    }

    /// Cache an orphan. Enforces the per-peer cap, then makes room in the
    /// pool: expired entries first, then the oldest.
    pub fn insert(&mut self, header: BlockHeader, peer: u64, now: u64) -> OrphanInsert {
        let id = header.id();
        if self.by_id.contains_key(&id) {
            return OrphanInsert::AlreadyKnown;
        }
        if self.peer_count(peer) >= MAX_ORPHANS_PER_PEER {
            return OrphanInsert::PerPeerLimit;
        }
        if self.by_id.len() >= MAX_ORPHAN_HEADERS {
            let expired = self.expire(now);
            if expired > 0 {
                debug!(expired, "expired orphan headers");
            }
            while self.by_id.len() >= MAX_ORPHAN_HEADERS {
                self.evict_oldest();
            }
        }
        self.by_prev.entry(header.prev_id).or_default().push(id);
        *self.per_peer.entry(peer).or_insert(0) += 1;
        self.by_id.insert(
            id,
            OrphanEntry {
                header,
                time_received: now,
                peer,
            },
        );
        OrphanInsert::Added
    }

    /// Remove and return every orphan whose parent is `parent_id`.
    pub fn take_children(&mut self, parent_id: &Hash256) -> Vec<OrphanEntry> {
        let ids = match self.by_prev.remove(parent_id) {
            Some(ids) => ids,
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.remove_entry(&id, false) {
                out.push(entry);
            }
        }
        out
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn expire(&mut self, now: u64) -> usize {
        let expired: Vec<Hash256> = self
            .by_id
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.time_received) > ORPHAN_TTL_SECS)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove_entry(id, true);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_id
            .iter()
            .min_by_key(|(id, e)| (e.time_received, **id))
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.remove_entry(&id, true);
        }
    }

    fn remove_entry(&mut self, id: &Hash256, unlink_prev: bool) -> Option<OrphanEntry> {
        let entry = self.by_id.remove(id)?;
        if let Some(count) = self.per_peer.get_mut(&entry.peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_peer.remove(&entry.peer);
            }
        }
        if unlink_prev {
            if let Some(siblings) = self.by_prev.get_mut(&entry.header.prev_id) {
                siblings.retain(|sib| sib != id);
                if siblings.is_empty() {
                    self.by_prev.remove(&entry.header.prev_id);
                }
            }
        }
        Some(entry)
    }
}
