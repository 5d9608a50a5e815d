//! Chat orchestration: the handler chain over incoming messages, the
//! simple chat strategy, prompt-resolved upstream Saptiva calls with a
//! unified sync/stream event surface, document RAG context assembly,
//! response sanitization and the fluent response builder.

pub mod builder;
pub mod context;
pub mod handlers;
pub mod sanitizer;
pub mod saptiva;
pub mod service;
pub mod strategy;

pub use builder::ChatResponseBuilder;
pub use saptiva::{LlmEvent, SaptivaClient, SaptivaMessage};
pub use service::ChatService;
