//! KV block management and response caching.
//!
//! - [`block`]: KvBlock, KvRef, BlockState definitions
//! - [`pager`]: fixed block pool with pinning and LRU eviction
//! - [`prefix`]: (model, token-aligned prefix) → KV reference map
//! - [`prompt`]: exact-match LRU of completed generations

pub mod block;
pub mod pager;
pub mod prefix;
pub mod prompt;
