//! kv-batch-serve: a continuous-batching inference core.
//!
//! Concurrent generation requests are admitted into a shared batch on a
//! fixed tick, prefilled together and advanced one decode step per tick,
//! with tokens streamed back per request. Two caches sit in front of the
//! backend: an exact-match prompt cache that replays whole responses, and a
//! token-aligned prefix cache that hands previously filled KV blocks back to
//! requests sharing a prefix.

pub mod cache;
pub mod config;
pub mod inference;
pub mod scheduler;
pub mod telemetry;

pub use config::Config;
pub use scheduler::{GenRequest, GenerateError, Scheduler, Token, Trace};
