//! Token-generation backend capability.
//!
//! The scheduler never computes tokens itself. It drives a [`Backend`]
//! through three batch-level calls per tick: prefill for newly admitted
//! prompts, a decode-budget query for the active set, and next-token
//! prediction for every active request.

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::block::KvHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Prefill failed: {0}")]
    Prefill(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Per-request input to [`Backend::predict_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeContext {
    /// Rolling context: the prompt plus every token generated so far.
    pub prompt: String,

    /// Backend state bound to the request's KV block, 0 if none yet.
    /// The backend may assign one in place.
    pub kv_handle: KvHandle,
}

impl DecodeContext {
    pub fn new(prompt: impl Into<String>, kv_handle: KvHandle) -> Self {
        Self {
            prompt: prompt.into(),
            kv_handle,
        }
    }
}

/// The compute side of inference, consumed only through this trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run the prefill pass over a whole batch of prompts at once.
    async fn prefill(&self, prompts: &[String]) -> Result<(), BackendError>;

    /// Ask how many of `batch_size` requests can be advanced this step.
    /// The answer may be smaller than `batch_size` when the backend is
    /// saturated.
    async fn decode(&self, batch_size: usize, seq_len: usize) -> Result<usize, BackendError>;

    /// Next token text for every context, in order. The backend may write a
    /// freshly assigned handle into each context's `kv_handle`.
    async fn predict_next(&self, contexts: &mut [DecodeContext]) -> Vec<String>;
}
