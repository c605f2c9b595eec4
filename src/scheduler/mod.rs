//! Continuous-batching scheduler.
//!
//! The scheduler is the orchestrator between callers and the backend:
//! 1. `generate` fingerprints a request; exact repeats are replayed from the
//!    prompt cache on their own task, everything else joins the admission queue
//! 2. every tick, up to `max_batch` queued requests are admitted, bound to a
//!    KV block (reused through the prefix cache when possible) and prefilled
//!    as one batch
//! 3. every active request is then advanced by one decode step and its token
//!    streamed to the caller
//! 4. finished requests feed the prompt and prefix caches and release their
//!    block pin
//!
//! One lock guards the queue and active set and is held only for list
//! surgery. The pager and both caches have their own locks; no operation
//! holds two at once, and none is held across a backend call.

pub mod request;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::pager::{new_shared_pager, SharedPager};
use crate::cache::prefix::PrefixCache;
use crate::cache::prompt::PromptCache;
use crate::config::{Config, EmitPolicy, SchedulerConfig};
use crate::inference::backend::{Backend, DecodeContext};
use crate::inference::tokenizer::{Tokenizer, WhitespaceTokenizer};
use crate::telemetry::{KvEvent, NoopTelemetry, Telemetry};

use request::InFlight;
pub use request::{
    FinishReason, GenRequest, GenerateError, Token, TokenReceiver, TokenResult, Trace,
    TraceHandle,
};

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests waiting for admission.
    pub queued: usize,
    /// Requests admitted and not yet finished.
    pub active: usize,
    pub ticks: u64,
    /// Requests that produced all their tokens.
    pub completed: u64,
    /// Requests served from the prompt cache.
    pub replayed: u64,
    /// Requests closed early: cancelled, slow consumer or shutdown.
    pub cancelled: u64,
    /// Requests failed by a backend error.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    completed: AtomicU64,
    replayed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
struct State {
    /// Ordered by priority (highest first), FIFO within a priority.
    queue: VecDeque<InFlight>,
    active: Vec<InFlight>,
    /// Active requests, including those moved out for the current decode step.
    active_count: usize,
    closed: bool,
}

/// The request scheduler.
pub struct Scheduler {
    config: SchedulerConfig,

    /// Tokens requested per KV allocation.
    alloc_tokens: usize,

    backend: Arc<dyn Backend>,
    pager: SharedPager,
    prefix: Arc<PrefixCache>,
    prompts: Arc<PromptCache>,
    telemetry: Arc<dyn Telemetry>,

    state: Mutex<State>,

    /// Held for the duration of a tick.
    round: tokio::sync::Mutex<()>,

    /// Cancelled once on shutdown; aborts blocked sends and replays.
    closing: CancellationToken,

    counters: Counters,
}

impl Scheduler {
    /// Create a scheduler with its own pager and caches sized from `config`,
    /// a whitespace tokenizer for prefix alignment and no telemetry.
    pub fn new(config: &Config, backend: Arc<dyn Backend>) -> Self {
        Self {
            config: config.scheduler.clone(),
            alloc_tokens: config.kv.alloc_tokens,
            backend,
            pager: new_shared_pager(&config.kv),
            prefix: Arc::new(PrefixCache::new(Arc::new(WhitespaceTokenizer))),
            prompts: Arc::new(PromptCache::new(config.prompt_cache.capacity)),
            telemetry: Arc::new(NoopTelemetry),
            state: Mutex::new(State::default()),
            round: tokio::sync::Mutex::new(()),
            closing: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Replace the prefix cache with an empty one aligned to `tokenizer`.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.prefix = Arc::new(PrefixCache::new(tokenizer));
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_pager(mut self, pager: SharedPager) -> Self {
        self.pager = pager;
        self
    }

    pub fn with_prefix_cache(mut self, prefix: Arc<PrefixCache>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_prompt_cache(mut self, prompts: Arc<PromptCache>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn pager(&self) -> &SharedPager {
        &self.pager
    }

    pub fn prefix_cache(&self) -> &Arc<PrefixCache> {
        &self.prefix
    }

    pub fn prompt_cache(&self) -> &Arc<PromptCache> {
        &self.prompts
    }

    /// Submit a request.
    ///
    /// Returns the token channel and a trace handle. The channel closes after
    /// exactly `max_tokens` tokens, or earlier on cancellation, backend
    /// failure or shutdown; read the trace once it has closed. `cancel` is
    /// checked once per tick while the request is active.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn generate(
        &self,
        cancel: CancellationToken,
        mut request: GenRequest,
    ) -> Result<(TokenReceiver, TraceHandle), GenerateError> {
        if self.closing.is_cancelled() {
            return Err(GenerateError::ShutDown);
        }
        if request.max_tokens == 0 {
            request.max_tokens = self.config.default_max_tokens;
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let trace = TraceHandle::default();

        if let Some(tokens) = self.prompts.get(&request.fingerprint()) {
            self.telemetry.prompt_cache(&request.model, true);
            self.counters.replayed.fetch_add(1, Ordering::Relaxed);
            debug!(
                model = %request.model,
                tokens = request.max_tokens,
                "Prompt cache hit, replaying"
            );
            tokio::spawn(replay(
                tokens,
                request.max_tokens,
                tx,
                trace.clone(),
                cancel,
                self.closing.clone(),
            ));
            return Ok((rx, trace));
        }
        self.telemetry.prompt_cache(&request.model, false);

        let record = InFlight::new(request, cancel, tx, trace.clone());
        let mut state = self.state.lock();
        if state.closed {
            return Err(GenerateError::ShutDown);
        }
        debug!(
            request_id = %record.request_id,
            model = %record.request.model,
            max_tokens = record.request.max_tokens,
            priority = record.request.priority,
            "Request queued"
        );
        let priority = record.request.priority;
        let pos = state
            .queue
            .partition_point(|queued| queued.request.priority >= priority);
        state.queue.insert(pos, record);

        Ok((rx, trace))
    }

    /// [`generate`](Self::generate), with the token channel wrapped as a stream.
    pub async fn generate_stream(
        &self,
        cancel: CancellationToken,
        request: GenRequest,
    ) -> Result<(impl Stream<Item = TokenResult>, TraceHandle), GenerateError> {
        let (rx, trace) = self.generate(cancel, request).await?;
        Ok((ReceiverStream::new(rx), trace))
    }

    /// Drive the tick loop until `shutdown` is cancelled or [`shutdown`](Self::shutdown)
    /// is called, then close every pending and active request.
    pub async fn run(&self, shutdown: CancellationToken) {
        let closing = self.closing.clone();
        let link = tokio::spawn(async move {
            shutdown.cancelled().await;
            closing.cancel();
        });

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.config.tick_interval_ms,
            max_batch = self.config.max_batch,
            max_active = self.config.max_active,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        link.abort();
        self.shutdown();
    }

    /// One scheduling round: admission, prefix resolution, prefill, then one
    /// decode step for the whole active set. A no-op after shutdown.
    ///
    /// Rounds never overlap: a call made while another round is in progress,
    /// including one driven by [`run`](Self::run), waits for it to finish.
    pub async fn tick(&self) {
        if self.closing.is_cancelled() {
            return;
        }
        let _round = self.round.lock().await;
        if self.closing.is_cancelled() {
            return;
        }
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let admitted = self.admit();
        if !admitted.is_empty() {
            self.prefill(admitted).await;
        }
        self.decode().await;
    }

    /// Close every pending and active request. Idempotent.
    pub fn shutdown(&self) {
        self.closing.cancel();
        let drained: Vec<InFlight> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.active_count = 0;
            let mut drained: Vec<InFlight> = state.queue.drain(..).collect();
            drained.append(&mut state.active);
            drained
        };

        info!(closed = drained.len(), "Scheduler shut down");
        for record in drained {
            self.abort(record, FinishReason::Shutdown);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn stats(&self) -> SchedulerStats {
        let (queued, active) = {
            let state = self.state.lock();
            (state.queue.len(), state.active_count)
        };
        SchedulerStats {
            queued,
            active,
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Take the next prefill batch off the queue, bounded by `max_batch` and
    /// the room left under `max_active`. Abandoned requests anywhere in the
    /// queue are closed here.
    fn admit(&self) -> Vec<InFlight> {
        let (batch, abandoned) = {
            let mut state = self.state.lock();

            // Abandoned requests leave the queue even when no slot is free.
            let queued = std::mem::take(&mut state.queue);
            let (live, abandoned): (VecDeque<InFlight>, VecDeque<InFlight>) = queued
                .into_iter()
                .partition(|record| !record.is_abandoned());
            state.queue = live;

            let room = self.config.max_active.saturating_sub(state.active_count);
            let take = self.config.max_batch.min(room).min(state.queue.len());
            let batch: Vec<InFlight> = state.queue.drain(..take).collect();
            (batch, abandoned)
        };

        for record in abandoned {
            self.abort(record, FinishReason::Cancelled);
        }
        batch
    }

    /// Reuse the longest cached prefix's block if it is still valid,
    /// otherwise allocate a fresh one. Either way the block ends up pinned.
    /// With no block available the request runs unbound.
    fn bind_block(&self, record: &mut InFlight) {
        let model = record.request.model.as_str();
        let hit = self.prefix.get_longest(model, &record.request.prompt);

        let reused = hit.as_ref().and_then(|found| {
            let mut pager = self.pager.lock();
            let id = pager.validate(&found.kv_ref)?;
            pager.pin(id);
            Some(id)
        });
        self.telemetry.prefix_cache(model, reused.is_some());

        if let Some(id) = reused {
            self.telemetry.kv_event(model, KvEvent::Pin);
            debug!(
                request_id = %record.request_id,
                block_id = id,
                matched_tokens = hit.map(|found| found.matched_tokens).unwrap_or(0),
                "Prefix reuse"
            );
            record.block = Some(id);
            return;
        }

        let allocation = {
            let mut pager = self.pager.lock();
            let allocation = pager.allocate(self.alloc_tokens);
            if let Some(alloc) = allocation {
                pager.pin(alloc.block_id);
            }
            allocation
        };

        match allocation {
            Some(alloc) => {
                if alloc.evicted {
                    self.telemetry.kv_event(model, KvEvent::Evict);
                }
                self.telemetry.kv_event(model, KvEvent::Alloc);
                self.telemetry.kv_event(model, KvEvent::Pin);
                record.block = Some(alloc.block_id);
            }
            None => {
                debug!(
                    request_id = %record.request_id,
                    "No KV block available, running without reuse"
                );
            }
        }
    }

    async fn prefill(&self, mut batch: Vec<InFlight>) {
        for record in &mut batch {
            self.bind_block(record);
        }

        let prompts: Vec<String> = batch
            .iter()
            .map(|record| record.request.prompt.clone())
            .collect();
        debug!(batch = batch.len(), "Prefill");

        if let Err(e) = self.backend.prefill(&prompts).await {
            warn!(batch = batch.len(), error = %e, "Prefill failed");
            for record in batch {
                self.fail(record, GenerateError::Backend(e.clone())).await;
            }
            return;
        }

        for record in &batch {
            let ms = record.elapsed_ms();
            record.trace.record_ttft(ms);
            self.telemetry.ttft(&record.request.model, ms);
        }
        self.park(batch);
    }

    async fn decode(&self) {
        let active = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.active)
        };
        if active.is_empty() {
            return;
        }

        let budget = match self.backend.decode(active.len(), 1).await {
            Ok(n) => n.min(active.len()),
            Err(e) => {
                warn!(active = active.len(), error = %e, "Decode failed");
                for record in active {
                    self.fail(record, GenerateError::Backend(e.clone())).await;
                }
                self.park(Vec::new());
                return;
            }
        };
        self.telemetry.decode_step(active.len());

        let mut contexts: Vec<DecodeContext> = {
            let pager = self.pager.lock();
            active
                .iter()
                .map(|record| {
                    let handle = record.block.map(|id| pager.handle(id)).unwrap_or(0);
                    DecodeContext::new(record.request.prompt.clone(), handle)
                })
                .collect()
        };
        let next_tokens = self.backend.predict_next(&mut contexts).await;

        let mut still = Vec::with_capacity(active.len());
        for (i, mut record) in active.into_iter().enumerate() {
            if record.is_abandoned() {
                self.abort(record, FinishReason::Cancelled);
                continue;
            }

            if i < budget {
                let text = next_tokens.get(i).cloned().unwrap_or_default();
                if let Err(reason) = self.deliver(&record, Ok(Token::new(text.as_str()))).await {
                    self.abort(record, reason);
                    continue;
                }
                record.request.prompt.push_str(&text);
                record.generated.push(text);

                let handle = contexts[i].kv_handle;
                if let Some(id) = record.block.filter(|_| handle != 0) {
                    self.pager.lock().set_handle(id, handle);
                }
            }

            if record.is_done() {
                self.complete(record);
            } else {
                still.push(record);
            }
        }

        self.park(still);
    }

    /// Put requests (back) into the active set, or close them if the
    /// scheduler shut down in the meantime.
    fn park(&self, records: Vec<InFlight>) {
        let leftovers = {
            let mut state = self.state.lock();
            if state.closed {
                records
            } else {
                state.active.extend(records);
                state.active_count = state.active.len();
                Vec::new()
            }
        };

        for record in leftovers {
            self.abort(record, FinishReason::Shutdown);
        }
    }

    /// Send one item under the configured emit policy.
    async fn deliver(&self, record: &InFlight, item: TokenResult) -> Result<(), FinishReason> {
        match self.config.emit_policy {
            EmitPolicy::Block => tokio::select! {
                biased;
                _ = record.cancel.cancelled() => Err(FinishReason::Cancelled),
                _ = self.closing.cancelled() => Err(FinishReason::Shutdown),
                sent = record.tx.send(item) => sent.map_err(|_| FinishReason::Cancelled),
            },
            EmitPolicy::Disconnect => match record.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(FinishReason::SlowConsumer),
                Err(TrySendError::Closed(_)) => Err(FinishReason::Cancelled),
            },
        }
    }

    /// Finish a request that produced every token: write both caches, then
    /// release the block pin. The block stays resident for reuse.
    fn complete(&self, record: InFlight) {
        let total = record.elapsed_ms();
        let model = record.request.model.as_str();
        let final_prompt = record.request.prompt.as_str();

        record.trace.complete(total, FinishReason::Length);
        self.telemetry.total_time(model, total);

        self.prompts
            .put(record.fingerprint.clone(), record.generated.clone());

        if let Some(id) = record.block {
            let tokens = self.prefix.token_count(final_prompt);
            let kv_ref = self.pager.lock().retag(id, tokens);
            if let Some(kv_ref) = kv_ref {
                self.prefix.set(model, final_prompt, kv_ref);
            }
            self.pager.lock().unpin(id);
            self.telemetry.kv_event(model, KvEvent::Unpin);
        }

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %record.request_id,
            model,
            tokens = record.generated.len(),
            total_ms = total,
            "Request complete"
        );
    }

    /// Close a request without caching anything. A bound block is unpinned
    /// and its stale prefix references invalidated.
    fn abort(&self, record: InFlight, reason: FinishReason) {
        if let Some(id) = record.block {
            {
                let mut pager = self.pager.lock();
                pager.retag(id, 0);
                pager.unpin(id);
            }
            self.telemetry
                .kv_event(&record.request.model, KvEvent::Unpin);
        }

        record.trace.abort(reason);
        match reason {
            FinishReason::BackendError => self.counters.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };

        debug!(
            request_id = %record.request_id,
            reason = ?reason,
            tokens = record.generated.len(),
            "Request closed early"
        );
    }

    /// Deliver a backend error and close the request.
    async fn fail(&self, record: InFlight, error: GenerateError) {
        // Best effort: the trace carries the reason even if this is not delivered.
        let _ = self.deliver(&record, Err(error)).await;
        self.abort(record, FinishReason::BackendError);
    }
}

/// Stream cached tokens to a caller, checking cancellation before each send.
async fn replay(
    tokens: Arc<[String]>,
    count: usize,
    tx: mpsc::Sender<TokenResult>,
    trace: TraceHandle,
    cancel: CancellationToken,
    closing: CancellationToken,
) {
    for text in tokens.iter().take(count) {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FinishReason::Cancelled),
            _ = closing.cancelled() => Err(FinishReason::Shutdown),
            sent = tx.send(Ok(Token::new(text.as_str()))) => sent.map_err(|_| FinishReason::Cancelled),
        };
        if let Err(reason) = sent {
            trace.abort(reason);
            return;
        }
    }
    trace.replayed();
}
