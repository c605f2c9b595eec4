//! Runtime configuration for kv-batch-serve.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-batch-serve", about = "Continuous-batching inference core demo")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Model identifier the request is addressed to.
    #[arg(short, long, default_value = "toy-1")]
    pub model: String,

    /// Prompt text to generate from.
    #[arg(short, long, default_value = "hello")]
    pub prompt: String,

    /// Tokens to generate (0 = scheduler default).
    #[arg(long, default_value_t = 16)]
    pub max_tokens: usize,

    /// Sampling temperature.
    #[arg(long, default_value_t = 0.0)]
    pub temperature: f32,

    /// Submit the same request this many times, one after another.
    #[arg(long, default_value_t = 2)]
    pub repeat: usize,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler loop settings.
    pub scheduler: SchedulerConfig,

    /// KV block pool settings.
    pub kv: KvConfig,

    /// Exact-match response cache settings.
    pub prompt_cache: PromptCacheConfig,

    /// Reference backend settings.
    pub backend: BackendConfig,
}

/// What the tick loop does when a request's output channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitPolicy {
    /// Wait for the consumer. A stalled consumer stalls the whole tick.
    #[default]
    Block,
    /// Finish the request as a slow consumer and move on.
    Disconnect,
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Control loop period in milliseconds.
    pub tick_interval_ms: u64,

    /// Maximum requests admitted into one prefill batch.
    pub max_batch: usize,

    /// Ceiling on concurrently decoding requests. Admission pauses at the cap.
    pub max_active: usize,

    /// Per-request output channel capacity.
    pub channel_capacity: usize,

    /// Substituted for requests that ask for zero tokens.
    pub default_max_tokens: usize,

    /// Full-channel behavior.
    pub emit_policy: EmitPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 25,
            max_batch: 32,
            max_active: 256,
            channel_capacity: 32,
            default_max_tokens: 64,
            emit_policy: EmitPolicy::Block,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// KV block pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Number of blocks in the pool.
    pub num_blocks: usize,

    /// Token capacity of each block.
    pub block_tokens: usize,

    /// Tokens requested per allocation.
    pub alloc_tokens: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            num_blocks: 64,
            block_tokens: 4096,
            alloc_tokens: 2048,
        }
    }
}

/// Exact-match response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptCacheConfig {
    /// Maximum number of cached fingerprints.
    pub capacity: usize,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self { capacity: 512 }
    }
}

/// Reference backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Simulated prefill latency per batch.
    pub prefill_delay_ms: u64,

    /// Simulated decode latency per step.
    pub decode_delay_ms: u64,

    /// Most requests advanced per decode step (0 = unlimited).
    pub max_decode_batch: usize,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings under which the KV pool could never serve a request.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.kv.alloc_tokens <= self.kv.block_tokens,
            "kv.alloc_tokens ({}) exceeds kv.block_tokens ({})",
            self.kv.alloc_tokens,
            self.kv.block_tokens
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.tick_interval_ms, 25);
        assert_eq!(cfg.scheduler.max_batch, 32);
        assert_eq!(cfg.scheduler.channel_capacity, 32);
        assert_eq!(cfg.kv.num_blocks, 64);
        assert_eq!(cfg.prompt_cache.capacity, 512);
        assert_eq!(cfg.scheduler.emit_policy, EmitPolicy::Block);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"scheduler": {"max_batch": 4, "emit_policy": "disconnect"}}"#)
                .unwrap();
        assert_eq!(cfg.scheduler.max_batch, 4);
        assert_eq!(cfg.scheduler.emit_policy, EmitPolicy::Disconnect);
        assert_eq!(cfg.scheduler.tick_interval_ms, 25);
        assert_eq!(cfg.kv.block_tokens, 4096);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.kv.alloc_tokens, 2048);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"kv": {"num_blocks": 8}, "prompt_cache": {"capacity": 3}}"#)
            .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.kv.num_blocks, 8);
        assert_eq!(cfg.prompt_cache.capacity, 3);
    }

    #[test]
    fn test_load_rejects_alloc_larger_than_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"kv": {"block_tokens": 1024, "alloc_tokens": 2048}}"#)
            .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("alloc_tokens"));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_tick_interval_never_zero() {
        let cfg = SchedulerConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.tick_interval(), Duration::from_millis(1));
    }
}
