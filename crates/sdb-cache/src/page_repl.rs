//! Page replacement: recency order and the eviction scan.
//!
//! Recency is a monotonic use-sequence over resident blocks; promotion
//! reassigns a block's sequence number, and the eviction scan walks the
//! order from the cold end. Blocks that are not safe to unload are
//! skipped without being reordered, so a pinned cold block does not get
//! artificially freshened by surviving a scan.

use crate::CoreState;
use sdb_serializer::Serializer;
use sdb_types::BlockId;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Recency order over resident blocks, coldest first.
#[derive(Debug, Default)]
pub(crate) struct LruOrder {
    next_seq: u64,
    by_block: HashMap<BlockId, u64>,
    by_age: BTreeSet<(u64, BlockId)>,
}

impl LruOrder {
    /// Promote `block` to most recently used, inserting it if new.
    pub(crate) fn touch(&mut self, block: BlockId) {
        if let Some(prev) = self.by_block.remove(&block) {
            let _ = self.by_age.remove(&(prev, block));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_block.insert(block, seq);
        self.by_age.insert((seq, block));
    }

    pub(crate) fn remove(&mut self, block: BlockId) {
        if let Some(seq) = self.by_block.remove(&block) {
            let _ = self.by_age.remove(&(seq, block));
        }
    }

    /// Blocks in eviction order, coldest first.
    pub(crate) fn coldest_first(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.by_age.iter().map(|(_, block)| *block)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_block.len()
    }
}

impl<S: Serializer + 'static> CoreState<S> {
    /// Evict clean, unused blocks from the cold end until the resident
    /// count is back within `max_blocks`. Non-evictable blocks are
    /// skipped in place; if nothing is evictable the cache runs over
    /// capacity until pins and dirty bits clear.
    pub(crate) fn evict_overflow(&mut self, max_blocks: usize) {
        while self.map.len() > max_blocks {
            let victim = {
                let state: &Self = self;
                state
                    .repl
                    .coldest_first()
                    .find(|block| state.safe_to_unload(*block))
            };
            let Some(victim) = victim else {
                debug!(
                    event = "eviction_stalled",
                    resident = self.map.len(),
                    capacity = max_blocks,
                    "no evictable block; over capacity until pins clear"
                );
                return;
            };
            self.stats.evictions += 1;
            self.do_unload_buf(victim);
            trace!(
                event = "cache_evict_clean",
                block = victim.0,
                resident = self.map.len()
            );
        }
    }

    /// Remove a block from the page map and recency order.
    ///
    /// The block must be safe to unload; violating that is an invariant
    /// breach and halts with the deadlock dump.
    pub(crate) fn do_unload_buf(&mut self, block: BlockId) {
        if !self.safe_to_unload(block) {
            let dump = self.dump();
            tracing::error!(
                event = "unsafe_unload_attempt",
                block = block.0,
                dump = %dump
            );
            panic!("block {} unloaded while in use", block.0);
        }
        let _ = self.map.remove(block);
        self.repl.remove(block);
        debug_assert_eq!(self.map.len(), self.repl.len());
    }
}
