//! Exact-match prompt cache.
//!
//! A bounded LRU from a request fingerprint (prompt, model, temperature,
//! max tokens) to the token texts a previous run of that exact request
//! produced. There is no prefix logic here: only byte-identical requests hit.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Capacity used when a non-positive capacity is configured.
const FALLBACK_CAPACITY: usize = 1024;

/// Exact request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PromptKey {
    pub prompt: String,
    pub model: String,
    /// Bit pattern of the requested temperature.
    pub temperature_bits: u32,
    pub max_tokens: usize,
}

impl PromptKey {
    pub fn new(prompt: &str, model: &str, temperature: f32, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.to_string(),
            model: model.to_string(),
            temperature_bits: temperature.to_bits(),
            max_tokens,
        }
    }
}

/// Hit/miss/eviction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner {
    entries: LruCache<PromptKey, Arc<[String]>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Thread-safe bounded LRU of completed generations.
pub struct PromptCache {
    inner: Mutex<Inner>,
}

impl PromptCache {
    /// Create a cache holding at most `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(FALLBACK_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Stored tokens for `key`, provided there are at least `key.max_tokens`
    /// of them. A hit becomes the most recently used entry.
    pub fn get(&self, key: &PromptKey) -> Option<Arc<[String]>> {
        let mut inner = self.inner.lock();
        let found = inner
            .entries
            .get(key)
            .filter(|tokens| tokens.len() >= key.max_tokens)
            .cloned();

        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Insert or replace the tokens for `key`, making it most recently used.
    /// Exceeding capacity evicts the least recently used fingerprint.
    pub fn put(&self, key: PromptKey, tokens: Vec<String>) {
        let mut inner = self.inner.lock();
        let probe = key.clone();
        if let Some((displaced, _)) = inner.entries.push(key, tokens.into()) {
            if displaced != probe {
                inner.evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PromptCacheStats {
        let inner = self.inner.lock();
        PromptCacheStats {
            entries: inner.entries.len(),
            capacity: inner.entries.cap().get(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}
