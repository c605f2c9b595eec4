//! Inference capabilities consumed by the scheduler.
//!
//! - [`backend`]: the pluggable token-generation backend trait
//! - [`tokenizer`]: text splitting used to align prefix-cache boundaries
//! - [`toy`]: a deterministic in-process backend

pub mod backend;
pub mod tokenizer;
pub mod toy;
