//! Adaptive retrieval for document-grounded chat.
//!
//! Classifies a user query by intent and complexity, picks a retrieval
//! strategy (overview = first chunks per document, semantic = vector
//! search with an adaptive threshold), executes it against the injected
//! vector index, and applies fallbacks when a strategy comes back empty.

pub mod analyze;
pub mod embedding;
mod error;
pub mod index;
pub mod intent;
pub mod orchestrator;
pub mod strategy;
pub mod types;

pub use error::{Result, RetrievalError};
pub use orchestrator::AdaptiveRetrievalOrchestrator;
