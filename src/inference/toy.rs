//! Deterministic reference backend.
//!
//! Produces language-ish continuations from a tiny fixed vocabulary. The
//! next token is a pure function of the rolling context, so identical
//! requests always generate identical streams. KV handles are assigned
//! lazily the first time a context without one is seen.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::BackendConfig;
use crate::inference::backend::{Backend, BackendError, DecodeContext};

const VOCAB: &[&str] = &[
    " llama", " on", " the", " high", " plain", ".", " gentle", ",", " wind", " hums", " softly",
];

/// The toy backend.
#[derive(Debug)]
pub struct ToyBackend {
    config: BackendConfig,

    /// Next handle to hand out. Starts at 1; 0 means unbound.
    next_handle: AtomicU64,

    prefill_calls: AtomicUsize,
    decode_calls: AtomicUsize,
}

impl ToyBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            prefill_calls: AtomicUsize::new(0),
            decode_calls: AtomicUsize::new(0),
        }
    }

    /// Next token for a given rolling context.
    pub fn next_token(prompt: &str) -> &'static str {
        if prompt.ends_with('.') {
            return " ";
        }
        let idx = (xxh3_64(prompt.as_bytes()) % VOCAB.len() as u64) as usize;
        let token = VOCAB[idx];
        // Avoid stuttering the same word twice in a row.
        if prompt.ends_with(token) {
            "."
        } else {
            token
        }
    }

    /// Number of prefill batches seen so far.
    pub fn prefill_calls(&self) -> usize {
        self.prefill_calls.load(Ordering::Relaxed)
    }

    /// Number of decode steps seen so far.
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::Relaxed)
    }
}

impl Default for ToyBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

#[async_trait]
impl Backend for ToyBackend {
    async fn prefill(&self, _prompts: &[String]) -> Result<(), BackendError> {
        self.prefill_calls.fetch_add(1, Ordering::Relaxed);
        if self.config.prefill_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.prefill_delay_ms)).await;
        }
        Ok(())
    }

    async fn decode(&self, batch_size: usize, _seq_len: usize) -> Result<usize, BackendError> {
        self.decode_calls.fetch_add(1, Ordering::Relaxed);
        if self.config.decode_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.decode_delay_ms)).await;
        }
        match self.config.max_decode_batch {
            0 => Ok(batch_size),
            cap => Ok(batch_size.min(cap)),
        }
    }

    async fn predict_next(&self, contexts: &mut [DecodeContext]) -> Vec<String> {
        contexts
            .iter_mut()
            .map(|ctx| {
                if ctx.kv_handle == 0 {
                    ctx.kv_handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                }
                Self::next_token(&ctx.prompt).to_string()
            })
            .collect()
    }
}
