//! Telemetry hooks fired by the scheduler.
//!
//! Hooks are pure side effects: nothing they record feeds back into
//! scheduling. [`NoopTelemetry`] is the default; [`PrometheusTelemetry`]
//! records into its own registry, which the caller owns and may expose.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// KV pager actions worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvEvent {
    Alloc,
    Pin,
    Unpin,
    Evict,
}

impl KvEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvEvent::Alloc => "alloc",
            KvEvent::Pin => "pin",
            KvEvent::Unpin => "unpin",
            KvEvent::Evict => "evict",
        }
    }
}

/// Scheduler observation points. Every method defaults to doing nothing.
pub trait Telemetry: Send + Sync {
    fn prompt_cache(&self, _model: &str, _hit: bool) {}

    fn prefix_cache(&self, _model: &str, _hit: bool) {}

    fn kv_event(&self, _model: &str, _event: KvEvent) {}

    /// One decode step over `batch_size` active requests.
    fn decode_step(&self, _batch_size: usize) {}

    fn ttft(&self, _model: &str, _ms: u64) {}

    fn total_time(&self, _model: &str, _ms: u64) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

fn hit_kind(hit: bool) -> &'static str {
    if hit {
        "hit"
    } else {
        "miss"
    }
}

/// Prometheus-backed telemetry with a private registry.
pub struct PrometheusTelemetry {
    registry: Registry,
    ttft_ms: HistogramVec,
    total_time_ms: HistogramVec,
    batch_size: Histogram,
    cache_events: IntCounterVec,
    kv_events: IntCounterVec,
    decode_steps: IntCounter,
}

impl PrometheusTelemetry {
    /// Build every metric family and register it in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ttft_ms = HistogramVec::new(
            HistogramOpts::new("ttft_ms", "Time to first token (ms)")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1000.0]),
            &["model"],
        )?;
        let total_time_ms = HistogramVec::new(
            HistogramOpts::new("total_time_ms", "Time to produce all tokens (ms)").buckets(vec![
                4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1000.0, 2000.0, 5000.0,
            ]),
            &["model"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Decode batch size")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )?;
        let cache_events = IntCounterVec::new(
            Opts::new("cache_events_total", "Cache events by cache type, outcome and model"),
            &["cache_type", "hit_kind", "model"],
        )?;
        let kv_events = IntCounterVec::new(
            Opts::new("kv_events_total", "KV pager events by action and model"),
            &["action", "model"],
        )?;
        let decode_steps = IntCounter::new("decode_steps_total", "Decode steps executed")?;

        registry.register(Box::new(ttft_ms.clone()))?;
        registry.register(Box::new(total_time_ms.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(cache_events.clone()))?;
        registry.register(Box::new(kv_events.clone()))?;
        registry.register(Box::new(decode_steps.clone()))?;

        Ok(Self {
            registry,
            ttft_ms,
            total_time_ms,
            batch_size,
            cache_events,
            kv_events,
            decode_steps,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered family.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Current value of a cache event counter.
    pub fn cache_events(&self, cache_type: &str, hit: bool, model: &str) -> u64 {
        self.cache_events
            .with_label_values(&[cache_type, hit_kind(hit), model])
            .get()
    }

    /// Current value of a KV event counter.
    pub fn kv_events(&self, event: KvEvent, model: &str) -> u64 {
        self.kv_events
            .with_label_values(&[event.as_str(), model])
            .get()
    }

    pub fn decode_steps(&self) -> u64 {
        self.decode_steps.get()
    }
}

impl Telemetry for PrometheusTelemetry {
    fn prompt_cache(&self, model: &str, hit: bool) {
        self.cache_events
            .with_label_values(&["prompt", hit_kind(hit), model])
            .inc();
    }

    fn prefix_cache(&self, model: &str, hit: bool) {
        self.cache_events
            .with_label_values(&["prefix", hit_kind(hit), model])
            .inc();
    }

    fn kv_event(&self, model: &str, event: KvEvent) {
        self.kv_events
            .with_label_values(&[event.as_str(), model])
            .inc();
    }

    fn decode_step(&self, batch_size: usize) {
        self.decode_steps.inc();
        self.batch_size.observe(batch_size as f64);
    }

    fn ttft(&self, model: &str, ms: u64) {
        self.ttft_ms.with_label_values(&[model]).observe(ms as f64);
    }

    fn total_time(&self, model: &str, ms: u64) {
        self.total_time_ms
            .with_label_values(&[model])
            .observe(ms as f64);
    }
}
