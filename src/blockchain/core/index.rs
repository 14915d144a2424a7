//! Block index arena.
//!
//! Entries never move once inserted; parents are referenced by [`BlockId`]
//! so walking ancestors never needs shared ownership. The active chain is a
//! separate vector of ids indexed by height.

use super::chain::{Block, BlockHeader, Sha256Hash};
use super::state::BlockUndo;
use crate::arith::block_proof;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Number of ancestors whose timestamps form the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Header known, body passed context-free and contextual checks.
    Valid,
    /// Connection failed or an ancestor is invalid; never retried.
    Failed,
}

#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Sha256Hash,
    pub header: BlockHeader,
    pub height: u32,
    pub parent: Option<BlockId>,
    pub chain_work: U256,
    /// Best anchor after this block was connected; zero until then.
    pub hash_anchor_end: Sha256Hash,
    pub status: BlockStatus,
    pub block: Option<Arc<Block>>,
    pub undo: Option<BlockUndo>,
}

#[derive(Debug, Default)]
pub struct ChainIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Sha256Hash, BlockId>,
    active: Vec<BlockId>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds `header` under its parent (looked up by `prev_hash`). An already
    /// known header returns the existing id.
    pub fn insert(&mut self, header: BlockHeader) -> BlockId {
        let hash = header.hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return *id;
        }

        let parent = self.by_hash.get(&header.prev_hash).copied();
        let (height, parent_work) = match parent {
            Some(p) => (self.entries[p.0].height + 1, self.entries[p.0].chain_work),
            None => (0, U256::zero()),
        };
        let chain_work = parent_work.saturating_add(block_proof(header.bits));

        let id = BlockId(self.entries.len());
        self.entries.push(BlockIndexEntry {
            hash,
            header,
            height,
            parent,
            chain_work,
            hash_anchor_end: [0u8; 32],
            status: BlockStatus::Valid,
            block: None,
            undo: None,
        });
        self.by_hash.insert(hash, id);
        id
    }

    pub fn get(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.0]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockIndexEntry {
        &mut self.entries[id.0]
    }

    pub fn lookup(&self, hash: &Sha256Hash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn parent(&self, id: BlockId) -> Option<BlockId> {
        self.entries[id.0].parent
    }

    pub fn tip(&self) -> Option<BlockId> {
        self.active.last().copied()
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.tip().map(|id| self.get(id).height)
    }

    /// Active-chain block at `height`.
    pub fn at_height(&self, height: u32) -> Option<BlockId> {
        self.active.get(height as usize).copied()
    }

    pub fn is_active(&self, id: BlockId) -> bool {
        let height = self.entries[id.0].height;
        self.at_height(height) == Some(id)
    }

    /// Ancestor of `id` at `height` (itself when the heights match).
    pub fn ancestor(&self, id: BlockId, height: u32) -> Option<BlockId> {
        if height > self.entries[id.0].height {
            return None;
        }
        if self.is_active(id) {
            return self.at_height(height);
        }
        let mut current = id;
        while self.entries[current.0].height > height {
            current = self.entries[current.0].parent?;
        }
        Some(current)
    }

    pub fn is_ancestor(&self, ancestor: BlockId, descendant: BlockId) -> bool {
        self.ancestor(descendant, self.entries[ancestor.0].height) == Some(ancestor)
    }

    /// Last common block of the branches ending at `a` and `b`.
    pub fn find_fork(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let (mut a, mut b) = (a, b);
        let height = self.entries[a.0].height.min(self.entries[b.0].height);
        a = self.ancestor(a, height)?;
        b = self.ancestor(b, height)?;
        while a != b {
            a = self.entries[a.0].parent?;
            b = self.entries[b.0].parent?;
        }
        Some(a)
    }

    /// Median timestamp of `id` and up to ten of its ancestors.
    pub fn median_time_past(&self, id: BlockId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = Some(id);
        while let Some(block) = current {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = &self.entries[block.0];
            times.push(entry.header.time as i64);
            current = entry.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Extends the active chain by `id`, which must be a child of the tip.
    pub(crate) fn push_active(&mut self, id: BlockId) {
        debug_assert_eq!(self.entries[id.0].height as usize, self.active.len());
        self.active.push(id);
    }

    pub(crate) fn pop_active(&mut self) -> Option<BlockId> {
        self.active.pop()
    }

    pub fn active_chain(&self) -> &[BlockId] {
        &self.active
    }

    /// Marks `id` and every known descendant as failed; returns the entries
    /// whose status changed.
    pub fn mark_failed(&mut self, id: BlockId) -> Vec<BlockId> {
        let mut changed = Vec::new();
        if self.entries[id.0].status != BlockStatus::Failed {
            self.entries[id.0].status = BlockStatus::Failed;
            changed.push(id);
        }
        for i in (id.0 + 1)..self.entries.len() {
            let descends = self.entries[i]
                .parent
                .map(|p| self.entries[p.0].status == BlockStatus::Failed)
                .unwrap_or(false);
            if descends && self.entries[i].status != BlockStatus::Failed {
                self.entries[i].status = BlockStatus::Failed;
                changed.push(BlockId(i));
            }
        }
        changed
    }

    /// Valid entry with the most work that is not behind the current tip,
    /// preferring the tip itself on ties.
    pub fn best_candidate(&self) -> Option<BlockId> {
        let mut best = self.tip();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.status != BlockStatus::Valid || entry.block.is_none() {
                continue;
            }
            let beats = match best {
                Some(b) => entry.chain_work > self.entries[b.0].chain_work,
                None => true,
            };
            if beats {
                best = Some(BlockId(i));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Sha256Hash, time: u32, salt: u8) -> BlockHeader {
        BlockHeader {
            prev_hash: prev,
            time,
            bits: 0x200fffff,
            nonce: [salt; 32],
            ..Default::default()
        }
    }

    fn build_line(index: &mut ChainIndex, from: Option<BlockId>, len: usize, salt: u8) -> Vec<BlockId> {
        let mut ids = Vec::new();
        let mut prev = from;
        for i in 0..len {
            let prev_hash = prev.map(|p| index.get(p).hash).unwrap_or([0u8; 32]);
            let id = index.insert(header(prev_hash, 1000 + i as u32 * 60, salt));
            ids.push(id);
            prev = Some(id);
        }
        ids
    }

    #[test]
    fn test_heights_and_work_accumulate() {
        let mut index = ChainIndex::new();
        let ids = build_line(&mut index, None, 3, 1);
        assert_eq!(index.get(ids[2]).height, 2);
        assert_eq!(index.get(ids[2]).parent, Some(ids[1]));
        assert!(index.get(ids[2]).chain_work > index.get(ids[1]).chain_work);
    }

    #[test]
    fn test_find_fork_between_branches() {
        let mut index = ChainIndex::new();
        let main = build_line(&mut index, None, 5, 1);
        let side = build_line(&mut index, Some(main[2]), 3, 2);
        assert_eq!(index.find_fork(main[4], side[2]), Some(main[2]));
        assert!(index.is_ancestor(main[1], side[0]));
        assert!(!index.is_ancestor(main[3], side[0]));
    }

    #[test]
    fn test_median_time_past() {
        let mut index = ChainIndex::new();
        let ids = build_line(&mut index, None, 15, 1);
        // Last eleven timestamps are heights 4..=14; the median is height 9.
        assert_eq!(index.median_time_past(ids[14]), 1000 + 9 * 60);
        assert_eq!(index.median_time_past(ids[0]), 1000);
    }

    #[test]
    fn test_mark_failed_propagates() {
        let mut index = ChainIndex::new();
        let ids = build_line(&mut index, None, 4, 1);
        assert_eq!(index.mark_failed(ids[1]), vec![ids[1], ids[2], ids[3]]);
        assert_eq!(index.get(ids[0]).status, BlockStatus::Valid);
        assert_eq!(index.get(ids[3]).status, BlockStatus::Failed);
        assert!(index.mark_failed(ids[2]).is_empty());
    }
}
