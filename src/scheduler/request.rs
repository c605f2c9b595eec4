//! Request, token and trace types shared between the scheduler and its callers.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::block::BlockId;
use crate::cache::prompt::PromptKey;
use crate::inference::backend::BackendError;

/// Errors surfaced to callers of [`Scheduler::generate`](super::Scheduler::generate)
/// or delivered on a request's token channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// A generation request as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenRequest {
    /// Model identifier.
    pub model: String,

    /// Prompt text.
    pub prompt: String,

    /// Tokens to generate (0 = scheduler default).
    pub max_tokens: usize,

    /// Sampling temperature.
    pub temperature: f32,

    /// Admission priority; higher is admitted first.
    pub priority: i32,
}

impl GenRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            max_tokens,
            temperature: 0.0,
            priority: 0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Exact-match cache fingerprint.
    pub fn fingerprint(&self) -> PromptKey {
        PromptKey::new(&self.prompt, &self.model, self.temperature, self.max_tokens)
    }
}

/// One streamed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Reserved; always 0 for now.
    pub id: u32,

    /// Delta text.
    pub text: String,
}

impl Token {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: 0,
            text: text.into(),
        }
    }
}

/// Items delivered on a request's channel.
pub type TokenResult = Result<Token, GenerateError>;

/// Receiving half handed to callers.
pub type TokenReceiver = mpsc::Receiver<TokenResult>;

/// Why a request's channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Reached max tokens.
    Length,
    /// Served entirely from the prompt cache.
    Replayed,
    /// Caller cancelled or dropped the receiver.
    Cancelled,
    /// The scheduler shut down first.
    Shutdown,
    /// Prefill or decode failed.
    BackendError,
    /// The channel was full under the disconnect emit policy.
    SlowConsumer,
}

/// Latency trace for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Time to first token in milliseconds.
    pub ttft_ms: u64,

    /// Time to produce every token in milliseconds.
    pub total_ms: u64,

    /// Set once the channel is closed.
    pub finish: Option<FinishReason>,
}

/// Shared view of a request's trace.
///
/// The fields are only meaningful once the token channel has been observed
/// closed: the scheduler writes the final values before closing it.
#[derive(Debug, Clone, Default)]
pub struct TraceHandle(Arc<Mutex<Trace>>);

impl TraceHandle {
    /// Current trace values.
    pub fn get(&self) -> Trace {
        *self.0.lock()
    }

    pub(crate) fn record_ttft(&self, ms: u64) {
        let mut trace = self.0.lock();
        if trace.ttft_ms == 0 {
            trace.ttft_ms = ms;
        }
    }

    pub(crate) fn complete(&self, total_ms: u64, reason: FinishReason) {
        let mut trace = self.0.lock();
        trace.total_ms = total_ms;
        trace.finish = Some(reason);
    }

    pub(crate) fn abort(&self, reason: FinishReason) {
        self.0.lock().finish = Some(reason);
    }

    /// Fixed trace of a prompt cache replay.
    pub(crate) fn replayed(&self) {
        *self.0.lock() = Trace {
            ttft_ms: 1,
            total_ms: 1,
            finish: Some(FinishReason::Replayed),
        };
    }
}

/// Scheduler-owned runtime record of one queued or active request.
///
/// Dropping it closes the request's channel.
pub(crate) struct InFlight {
    pub request_id: Uuid,

    /// Request with `prompt` acting as the rolling context.
    pub request: GenRequest,

    /// Fingerprint of the request as submitted.
    pub fingerprint: PromptKey,

    pub cancel: CancellationToken,
    pub tx: mpsc::Sender<TokenResult>,
    pub trace: TraceHandle,

    /// Token texts emitted so far.
    pub generated: Vec<String>,

    pub created: Instant,

    /// Pinned KV block, if one could be bound.
    pub block: Option<BlockId>,
}

impl InFlight {
    pub fn new(
        request: GenRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<TokenResult>,
        trace: TraceHandle,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            fingerprint: request.fingerprint(),
            request,
            cancel,
            tx,
            trace,
            generated: Vec::new(),
            created: Instant::now(),
            block: None,
        }
    }

    /// Caller cancelled or stopped listening.
    pub fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn is_done(&self) -> bool {
        self.generated.len() >= self.request.max_tokens
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }
}
