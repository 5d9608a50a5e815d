//! Chat session and message persistence.
//!
//! SQLite-backed store with owner checks on every operation, cached
//! history reads through the shared KV cache, canvas-state blobs and
//! conversation export.

mod db;
mod error;
mod store;
mod types;

pub use db::init_db;
pub use error::{Result, SessionError};
pub use store::{ExportFormat, SessionStore};
pub use types::{ChatMessage, ChatSession, DateRange, NewMessage, SessionPage, SessionPatch};
