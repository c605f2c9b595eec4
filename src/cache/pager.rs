//! KV block pager: a fixed pool of blocks with LRU eviction.
//!
//! The pager owns every block for the lifetime of the process. Blocks move
//! between three states:
//! - free: on the free list, handed out first-fit by [`KvPager::allocate`]
//! - resident: holding state, tracked by the LRU, evictable
//! - pinned: reserved by an active request, never evicted
//!
//! When the free list has nothing large enough, the least-recently-used
//! unpinned block is evicted and reused. If every block is pinned,
//! allocation yields `None`; callers treat that as a degraded mode, not an
//! error.

use std::collections::VecDeque;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::block::{BlockId, BlockState, KvBlock, KvHandle, KvRef};
use crate::config::KvConfig;

/// Outcome of a successful [`KvPager::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Block handed to the caller.
    pub block_id: BlockId,

    /// Whether a resident block had to be evicted to satisfy the request.
    pub evicted: bool,
}

/// Point-in-time pager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub resident_blocks: usize,
    pub pinned_blocks: usize,
    /// Successful allocations, including those served by eviction.
    pub allocations: u64,
    pub evictions: u64,
    /// Allocations that failed because every block was pinned.
    pub exhausted: u64,
    /// Allocations that failed because no block is large enough.
    pub oversized: u64,
}

/// The KV block pager.
pub struct KvPager {
    /// Block arena, indexed by [`BlockId`].
    blocks: Vec<KvBlock>,

    /// Free block IDs in first-fit scan order.
    free: VecDeque<BlockId>,

    /// Resident blocks, most recently used first.
    lru: LruCache<BlockId, ()>,

    /// Token capacity of every block.
    block_tokens: usize,

    allocations: u64,
    evictions: u64,
    exhausted: u64,
    oversized: u64,
}

impl KvPager {
    /// Create a pager with `config.num_blocks` free blocks of
    /// `config.block_tokens` capacity each.
    pub fn new(config: &KvConfig) -> Self {
        let blocks: Vec<KvBlock> = (0..config.num_blocks)
            .map(|id| KvBlock::new(id, config.block_tokens))
            .collect();
        let free = (0..config.num_blocks).collect();

        Self {
            blocks,
            free,
            lru: LruCache::unbounded(),
            block_tokens: config.block_tokens,
            allocations: 0,
            evictions: 0,
            exhausted: 0,
            oversized: 0,
        }
    }

    /// Hand out a block able to hold `required_tokens`.
    ///
    /// First-fit over the free list, then LRU eviction among unpinned
    /// resident blocks. The returned block is resident and most recently
    /// used, but not pinned.
    pub fn allocate(&mut self, required_tokens: usize) -> Option<Allocation> {
        if required_tokens > self.block_tokens {
            self.oversized += 1;
            debug!(
                required_tokens,
                block_tokens = self.block_tokens,
                "KV allocation larger than any block"
            );
            return None;
        }

        let free_pos = self
            .free
            .iter()
            .position(|&id| self.blocks[id].capacity >= required_tokens);

        if let Some(pos) = free_pos {
            let id = self.free.remove(pos)?;
            let block = &mut self.blocks[id];
            block.state = BlockState::Resident;
            block.touch();
            self.lru.put(id, ());
            self.allocations += 1;
            return Some(Allocation {
                block_id: id,
                evicted: false,
            });
        }

        // Scan from the LRU tail, skipping pinned blocks.
        let victim = self
            .lru
            .iter()
            .rev()
            .map(|(&id, _)| id)
            .find(|&id| {
                let block = &self.blocks[id];
                !block.is_pinned() && block.capacity >= required_tokens
            });

        match victim {
            Some(id) => {
                let block = &mut self.blocks[id];
                block.recycle();
                block.touch();
                self.lru.put(id, ());
                self.allocations += 1;
                self.evictions += 1;
                debug!(block_id = id, generation = block.generation, "Evicted block for reuse");
                Some(Allocation {
                    block_id: id,
                    evicted: true,
                })
            }
            None => {
                self.exhausted += 1;
                debug!(required_tokens, "KV pool exhausted: every block is pinned");
                None
            }
        }
    }

    /// Return a block to the free list, clearing its pin and contents.
    ///
    /// Returns `false` if the ID is unknown or the block was already free.
    pub fn free(&mut self, id: BlockId) -> bool {
        let Some(block) = self.blocks.get_mut(id) else {
            return false;
        };
        if block.is_free() {
            return false;
        }
        block.state = BlockState::Free;
        block.recycle();
        self.lru.pop(&id);
        self.free.push_back(id);
        true
    }

    /// Reserve a resident block so it cannot be evicted.
    ///
    /// Returns `false` for unknown or free blocks.
    pub fn pin(&mut self, id: BlockId) -> bool {
        match self.blocks.get_mut(id) {
            Some(block) if !block.is_free() => {
                block.state = BlockState::Pinned;
                block.touch();
                true
            }
            _ => false,
        }
    }

    /// Release a reservation. The block stays resident and becomes the most
    /// recently used.
    ///
    /// Returns `false` if the block was not pinned.
    pub fn unpin(&mut self, id: BlockId) -> bool {
        match self.blocks.get_mut(id) {
            Some(block) if block.is_pinned() => {
                block.state = BlockState::Resident;
                block.touch();
                self.lru.put(id, ());
                true
            }
            _ => false,
        }
    }

    /// Look up a resident (pinned or unpinned) block.
    pub fn by_id(&self, id: BlockId) -> Option<&KvBlock> {
        self.blocks.get(id).filter(|block| !block.is_free())
    }

    /// Re-validate a weak reference taken earlier.
    ///
    /// Succeeds only if the block is still resident, holds the same generation
    /// of content, and is not reserved by another request.
    pub fn validate(&self, kv_ref: &KvRef) -> Option<BlockId> {
        self.by_id(kv_ref.block_id)
            .filter(|block| block.generation == kv_ref.generation && !block.is_pinned())
            .map(|block| block.id)
    }

    /// A weak reference to a resident block.
    pub fn reference(&self, id: BlockId, tokens: usize) -> Option<KvRef> {
        self.by_id(id).map(|block| block.reference(tokens))
    }

    /// Mark a resident block's contents as changed, invalidating every
    /// reference taken earlier, and return a fresh one. The backend handle is
    /// kept.
    pub fn retag(&mut self, id: BlockId, tokens: usize) -> Option<KvRef> {
        let block = self.blocks.get_mut(id).filter(|block| !block.is_free())?;
        block.generation += 1;
        Some(block.reference(tokens))
    }

    /// Backend handle bound to a block (0 if unbound or not resident).
    pub fn handle(&self, id: BlockId) -> KvHandle {
        self.by_id(id).map(|block| block.handle).unwrap_or(0)
    }

    /// Persist a backend handle onto a resident block.
    pub fn set_handle(&mut self, id: BlockId, handle: KvHandle) -> bool {
        match self.blocks.get_mut(id) {
            Some(block) if !block.is_free() => {
                block.handle = handle;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of pool occupancy and counters.
    pub fn stats(&self) -> PagerStats {
        let pinned = self.blocks.iter().filter(|b| b.is_pinned()).count();
        let free = self.free.len();
        PagerStats {
            total_blocks: self.blocks.len(),
            free_blocks: free,
            resident_blocks: self.blocks.len() - free - pinned,
            pinned_blocks: pinned,
            allocations: self.allocations,
            evictions: self.evictions,
            exhausted: self.exhausted,
            oversized: self.oversized,
        }
    }
}

/// Thread-safe wrapper around the pager.
pub type SharedPager = Arc<Mutex<KvPager>>;

/// Create a new thread-safe pager.
pub fn new_shared_pager(config: &KvConfig) -> SharedPager {
    Arc::new(Mutex::new(KvPager::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pager(num_blocks: usize) -> KvPager {
        KvPager::new(&KvConfig {
            num_blocks,
            block_tokens: 1024,
            ..Default::default()
        })
    }

    #[test]
    fn test_allocate_first_fit_from_free_list() {
        let mut pager = small_pager(4);

        let a = pager.allocate(512).unwrap();
        let b = pager.allocate(512).unwrap();

        assert_eq!(a.block_id, 0);
        assert_eq!(b.block_id, 1);
        assert!(!a.evicted);
        assert_eq!(pager.stats().free_blocks, 2);
        assert_eq!(pager.stats().resident_blocks, 2);
    }

    #[test]
    fn test_oversized_request_gets_nothing() {
        let mut pager = small_pager(2);
        assert!(pager.allocate(4096).is_none());

        let stats = pager.stats();
        assert_eq!(stats.oversized, 1);
        assert_eq!(stats.exhausted, 0);
        assert_eq!(stats.free_blocks, 2);
    }

    #[test]
    fn test_eviction_picks_least_recently_used_unpinned() {
        let mut pager = small_pager(3);
        for _ in 0..3 {
            pager.allocate(16).unwrap();
        }
        // Block 0 is the LRU tail but pinned, so block 1 is the victim.
        assert!(pager.pin(0));

        let alloc = pager.allocate(16).unwrap();
        assert_eq!(alloc.block_id, 1);
        assert!(alloc.evicted);
        assert_eq!(pager.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_bumps_generation_and_drops_handle() {
        let mut pager = small_pager(1);
        let first = pager.allocate(16).unwrap().block_id;
        pager.set_handle(first, 42);
        let stale = pager.reference(first, 3).unwrap();

        let again = pager.allocate(16).unwrap();
        assert_eq!(again.block_id, first);
        assert_eq!(pager.handle(first), 0);
        assert!(pager.validate(&stale).is_none());
    }

    #[test]
    fn test_validate_rejects_pinned_block() {
        let mut pager = small_pager(2);
        let id = pager.allocate(16).unwrap().block_id;
        let kv_ref = pager.reference(id, 1).unwrap();

        assert_eq!(pager.validate(&kv_ref), Some(id));
        pager.pin(id);
        assert!(pager.validate(&kv_ref).is_none());
        pager.unpin(id);
        assert_eq!(pager.validate(&kv_ref), Some(id));
    }

    #[test]
    fn test_free_returns_block_to_free_list() {
        let mut pager = small_pager(2);
        let id = pager.allocate(16).unwrap().block_id;
        pager.pin(id);

        assert!(pager.free(id));
        assert!(!pager.free(id));
        assert!(pager.by_id(id).is_none());
        assert!(!pager.pin(id));

        let stats = pager.stats();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.pinned_blocks, 0);
    }

    #[test]
    fn test_retag_keeps_handle_and_stales_old_refs() {
        let mut pager = small_pager(1);
        let id = pager.allocate(16).unwrap().block_id;
        pager.set_handle(id, 7);
        let old = pager.reference(id, 1).unwrap();

        let fresh = pager.retag(id, 4).unwrap();
        assert_eq!(fresh.tokens, 4);
        assert_eq!(pager.handle(id), 7);
        assert!(pager.validate(&old).is_none());
        assert_eq!(pager.validate(&fresh), Some(id));
    }

    #[test]
    fn test_unpin_requires_pin() {
        let mut pager = small_pager(1);
        let id = pager.allocate(16).unwrap().block_id;
        assert!(!pager.unpin(id));
        assert!(pager.pin(id));
        assert!(pager.unpin(id));
    }
}
