use serde::{Deserialize, Serialize};

/// A persisted chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    /// UUIDv7 primary key — time-sortable.
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub pinned: bool,
    /// Opaque sidebar state preserved across reloads. No schema enforced.
    pub canvas_state: Option<serde_json::Value>,
    pub message_count: u32,
    pub last_model: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Set when the message spawned a research task.
    pub task_id: Option<String>,
    pub created_at: String,
}

/// Input for appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub task_id: Option<String>,
}

/// Inclusive RFC3339 bounds for session listing.
#[derive(Debug, Clone, Default)]
pub struct DateRange {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// One page of a session listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPage {
    pub sessions: Vec<ChatSession>,
    pub total_count: u64,
    pub has_more: bool,
}

/// Partial session update (rename / pin).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub pinned: Option<bool>,
}
