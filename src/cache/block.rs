//! KV block types.
//!
//! A KV block is an opaque, capacity-bounded slot of backend generation
//! state. Blocks live in a fixed arena owned by the pager and are addressed
//! by small integer IDs; the backend's own handle for the state is stored
//! separately and never assumed to equal the index.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Index of a block inside the pager's arena.
pub type BlockId = usize;

/// Backend-issued handle for the state behind a block (0 = unbound).
pub type KvHandle = u64;

/// Lifecycle position of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    /// On the free list, holding nothing useful.
    Free,
    /// Resident and tracked by the LRU, eligible for eviction.
    Resident,
    /// Resident and reserved by an active request.
    Pinned,
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockState::Free => write!(f, "free"),
            BlockState::Resident => write!(f, "resident"),
            BlockState::Pinned => write!(f, "pinned"),
        }
    }
}

/// A single KV block.
#[derive(Debug, Clone)]
pub struct KvBlock {
    /// Arena index.
    pub id: BlockId,

    /// Token capacity.
    pub capacity: usize,

    /// Current lifecycle state.
    pub state: BlockState,

    /// Backend handle bound to this block, 0 until the backend assigns one.
    pub handle: KvHandle,

    /// Bumped every time the block's contents are discarded or rewritten,
    /// so stale [`KvRef`]s can be told apart from live ones.
    pub generation: u64,

    /// Timestamp of last allocation or pin.
    pub last_access: Instant,
}

impl KvBlock {
    /// Create a free block.
    pub fn new(id: BlockId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            state: BlockState::Free,
            handle: 0,
            generation: 0,
            last_access: Instant::now(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.state == BlockState::Pinned
    }

    pub fn is_free(&self) -> bool {
        self.state == BlockState::Free
    }

    /// Record an access.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Discard whatever the block held: drop the backend handle and start a
    /// new generation.
    pub fn recycle(&mut self) {
        self.handle = 0;
        self.generation += 1;
    }

    /// A weak reference to this block as it is right now.
    pub fn reference(&self, tokens: usize) -> KvRef {
        KvRef {
            block_id: self.id,
            tokens,
            generation: self.generation,
        }
    }
}

/// A weak, by-ID reference to a block, stored as a cache value.
///
/// Holding a `KvRef` grants nothing: it must be re-validated against the
/// pager before use because the block may have been evicted and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvRef {
    /// Referenced block.
    pub block_id: BlockId,

    /// Number of prefix tokens the block's state covers.
    pub tokens: usize,

    /// Block generation at the time the reference was taken.
    pub generation: u64,
}
