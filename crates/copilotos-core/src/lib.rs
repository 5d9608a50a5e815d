//! Shared foundation for the CopilotOS gateway workspace.
//!
//! Holds the immutable runtime configuration, the error taxonomy used by
//! every wire envelope, the chat domain types that flow through the
//! orchestration pipeline, the process-local KV cache, and the PII
//! scrubber applied to log output.

pub mod cache;
pub mod config;
pub mod error;
pub mod scrub;
pub mod types;

pub use error::{ApiError, Result};
