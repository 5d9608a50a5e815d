//! Per-model system prompt registry.
//!
//! Loads a declarative YAML file mapping model names to prompt entries,
//! resolves concrete system prompts (placeholder substitution, tool
//! markdown injection, addenda) and generation parameters with
//! channel-scoped token budgets, and fingerprints every resolved prompt
//! for telemetry and cache discrimination.

mod error;
mod registry;

pub use error::{PromptError, Result};
pub use registry::{
    channel_max_tokens, ModelParams, PromptEntry, PromptMetadata, PromptRegistry, ResolvedParams,
};
