//! Prefix cache: maps (model, token-aligned prefix) to a KV block reference.
//!
//! Prefixes are keyed by a rolling 64-bit hash computed over tokenizer
//! output. Every token boundary of a text yields its own hash, each one
//! seeded by the hash of the boundary before it, so every prefix length has
//! a distinct, order-sensitive key and a longest-match probe costs one map
//! lookup per token.
//!
//! Two different prefixes of equal token count that collide on the 64-bit
//! hash are indistinguishable here. No content comparison is made on a hit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::cache::block::KvRef;
use crate::inference::tokenizer::Tokenizer;

/// Seed for the hash of the first token boundary.
const ROOT_SEED: u64 = 0;

/// Rolling hash for every token boundary, shortest prefix first.
pub fn boundary_hashes<S: AsRef<str>>(tokens: &[S]) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(tokens.len());
    let mut running = ROOT_SEED;
    for token in tokens {
        running = xxh3_64_with_seed(token.as_ref().as_bytes(), running);
        hashes.push(running);
    }
    hashes
}

/// Result of a longest-prefix probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Stored reference for the matched prefix.
    pub kv_ref: KvRef,

    /// Number of tokens in the matched prefix.
    pub matched_tokens: usize,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Inner {
    /// model → boundary hash → reference.
    entries: HashMap<String, HashMap<u64, KvRef>>,
    hits: u64,
    misses: u64,
}

/// Thread-safe prefix → KV reference map.
pub struct PrefixCache {
    tokenizer: Arc<dyn Tokenizer>,
    inner: Mutex<Inner>,
}

impl PrefixCache {
    /// Create an empty cache that aligns prefixes with `tokenizer`.
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of tokens `text` splits into under this cache's tokenizer.
    pub fn token_count(&self, text: &str) -> usize {
        self.tokenizer.tokenize(text).len()
    }

    /// Store `kv_ref` under the hash of the full `prefix`.
    ///
    /// Shorter boundaries of `prefix` are not registered. Text with no
    /// tokens is ignored.
    pub fn set(&self, model: &str, prefix: &str, kv_ref: KvRef) {
        let tokens = self.tokenizer.tokenize(prefix);
        let Some(&key) = boundary_hashes(&tokens).last() else {
            return;
        };

        let mut inner = self.inner.lock();
        inner
            .entries
            .entry(model.to_string())
            .or_default()
            .insert(key, kv_ref);
    }

    /// Reference stored for exactly `prefix`, if any.
    pub fn get_exact(&self, model: &str, prefix: &str) -> Option<KvRef> {
        let tokens = self.tokenizer.tokenize(prefix);
        let key = *boundary_hashes(&tokens).last()?;

        let inner = self.inner.lock();
        inner.entries.get(model)?.get(&key).copied()
    }

    /// Longest previously stored prefix of `full` for `model`.
    ///
    /// Probes from the longest boundary down to the shortest and returns the
    /// first hit.
    pub fn get_longest(&self, model: &str, full: &str) -> Option<PrefixMatch> {
        let tokens = self.tokenizer.tokenize(full);
        let hashes = boundary_hashes(&tokens);

        let mut inner = self.inner.lock();
        let found = inner.entries.get(model).and_then(|by_hash| {
            hashes
                .iter()
                .enumerate()
                .rev()
                .find_map(|(i, hash)| {
                    by_hash.get(hash).map(|&kv_ref| PrefixMatch {
                        kv_ref,
                        matched_tokens: i + 1,
                    })
                })
        });

        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Total number of stored prefixes across all models.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PrefixCacheStats {
        let inner = self.inner.lock();
        PrefixCacheStats {
            entries: inner.entries.values().map(HashMap::len).sum(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
