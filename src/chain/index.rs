//! In-memory header DAG and the active chain.
//!
//! Index entries live in an arena for the process lifetime; `parent` is a
//! non-owning arena index. The active chain is a dense height -> entry
//! vector.

use crate::constants::MEDIAN_TIME_SPAN;
use crate::primitives::header::BlockHeader;
use crate::primitives::{Hash256, U256};
use std::collections::HashMap;

/// Arena index of a block-index entry.
pub type EntryId = usize;

/// Validation status bitset.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct BlockStatus(u8);

impl BlockStatus {
    const HAVE_HEADER: u8 = 1 << 0;
    const VALID_HEADER: u8 = 1 << 1;
    const VALID_POW: u8 = 1 << 2;
    const FAILED: u8 = 1 << 3;
    const FAILED_CHILD: u8 = 1 << 4;

    pub fn with_header_valid() -> Self {
        BlockStatus(Self::HAVE_HEADER | Self::VALID_HEADER | Self::VALID_POW)
    }

    pub fn has_header(&self) -> bool {
        self.0 & Self::HAVE_HEADER != 0
    }

    pub fn is_valid_header(&self) -> bool {
        self.0 & Self::VALID_HEADER != 0
    }

    pub fn has_valid_pow(&self) -> bool {
        self.0 & Self::VALID_POW != 0
    }

    pub fn is_failed(&self) -> bool {
        self.0 & Self::FAILED != 0
    }

    pub fn is_failed_child(&self) -> bool {
        self.0 & Self::FAILED_CHILD != 0
    }

    /// Failed itself or descends from a failed block.
    pub fn is_invalid(&self) -> bool {
        self.0 & (Self::FAILED | Self::FAILED_CHILD) != 0
    }

    pub fn set_failed(&mut self) {
        self.0 |= Self::FAILED;
    }

    pub fn set_failed_child(&mut self) {
        self.0 |= Self::FAILED_CHILD;
    }

    pub fn clear_failure(&mut self) {
        self.0 &= !(Self::FAILED | Self::FAILED_CHILD);
    }
}

pub struct BlockIndexEntry {
    pub id: Hash256,
    pub header: BlockHeader,
    pub height: u32,
    pub parent: Option<EntryId>,
    pub chain_work: U256,
    pub status: BlockStatus,
    pub time_received: u64,
}

/// Arena of every header this node has ever validated. Entries are never
/// removed while the process runs.
#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_id: HashMap<Hash256, EntryId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, e: EntryId) -> &BlockIndexEntry {
        &self.entries[e]
    }

    pub fn get_mut(&mut self, e: EntryId) -> &mut BlockIndexEntry {
        &mut self.entries[e]
    }

    pub fn lookup(&self, id: &Hash256) -> Option<EntryId> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.by_id.contains_key(id)
    }

    /// Insert a new entry. The id must not already be present.
    pub fn insert(&mut self, entry: BlockIndexEntry) -> EntryId {
        debug_assert!(!self.by_id.contains_key(&entry.id));
        let e = self.entries.len();
        self.by_id.insert(entry.id, e);
        self.entries.push(entry);
        e
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &BlockIndexEntry)> {
        self.entries.iter().enumerate()
    }

    /// Walk `parent` links down to the requested height.
    pub fn ancestor(&self, mut e: EntryId, height: u32) -> Option<EntryId> {
        if height > self.entries[e].height {
            return None;
        }
        while self.entries[e].height > height {
            e = self.entries[e].parent?;
        }
        Some(e)
    }

    /// Lowest common ancestor. `None` when the walks do not meet, which
    /// callers must handle.
    pub fn last_common_ancestor(&self, a: EntryId, b: EntryId) -> Option<EntryId> {
        let min_height = self.entries[a].height.min(self.entries[b].height);
        let mut a = self.ancestor(a, min_height)?;
        let mut b = self.ancestor(b, min_height)?;
        while a != b {
            a = self.entries[a].parent?;
            b = self.entries[b].parent?;
        }
        Some(a)
    }

    /// Median of the previous `MEDIAN_TIME_SPAN` timestamps ending at `e`.
    pub fn median_time_past(&self, e: EntryId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(e);
        while let Some(c) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.entries[c].header.time);
            cursor = self.entries[c].parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }
}

/// Dense height -> entry mapping for the selected best chain.
#[derive(Default)]
pub struct ActiveChain {
    heights: Vec<EntryId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks, genesis included.
    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }

    /// Height of the tip.
    pub fn height(&self) -> Option<u32> {
        self.heights.len().checked_sub(1).map(|h| h as u32)
    }

    pub fn tip(&self) -> Option<EntryId> {
        self.heights.last().copied()
    }

    pub fn at(&self, height: u32) -> Option<EntryId> {
        self.heights.get(height as usize).copied()
    }

    /// False for out-of-range heights and entries not on the chain.
    pub fn contains(&self, index: &BlockIndex, e: EntryId) -> bool {
        if e >= index.len() {
            return false;
        }
        self.at(index.get(e).height) == Some(e)
    }

    pub fn push(&mut self, index: &BlockIndex, e: EntryId) {
        debug_assert_eq!(index.get(e).height as usize, self.heights.len());
        self.heights.push(e);
    }

    /// Drop everything above `height`, keeping `height` as the tip.
    pub fn truncate_to(&mut self, height: u32) {
        self.heights.truncate(height as usize + 1);
    }
}
