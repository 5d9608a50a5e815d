use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named content bucket that determines the output token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Chat,
    Report,
    Title,
    Summary,
    Code,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Report => "report",
            Channel::Title => "title",
            Channel::Summary => "summary",
            Channel::Code => "code",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Channel::Chat),
            "report" => Ok(Channel::Report),
            "title" => Ok(Channel::Title),
            "summary" => Ok(Channel::Summary),
            "code" => Ok(Channel::Code),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// A single prior-context message forwarded to the upstream model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// Immutable per-request context for a chat message.
///
/// Once a session has been resolved, derivations produce a new value via
/// [`ChatContext::with_session`] rather than mutating in place.
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub user_id: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
    pub message: String,
    pub prior_context: Option<Vec<ContextMessage>>,
    pub model: String,
    /// Content bucket controlling the output token budget.
    pub channel: Channel,
    pub tools_enabled: HashMap<String, bool>,
    pub stream: bool,
    pub document_ids: Vec<String>,
    pub tool_results: HashMap<String, serde_json::Value>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub kill_switch_active: bool,
}

impl ChatContext {
    /// Functional update: same request, resolved session id.
    pub fn with_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..self.clone()
        }
    }

    /// Names of tools the client enabled for this request.
    pub fn enabled_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools_enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Extracted document text as stored in the shared KV cache by the file
/// extraction collaborator. Key layout: `files:extraction:<file_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub file_id: String,
    pub filename: String,
    pub content_type: String,
    pub pages: Option<u32>,
    pub text: String,
    /// Owner. Reads on behalf of any other user are dropped.
    pub user_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub fn extraction_cache_key(file_id: &str) -> String {
    format!("files:extraction:{file_id}")
}

/// Token usage reported by the upstream model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokensUsed {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokensUsed {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// Metadata about a processed message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub message_id: String,
    pub chat_id: String,
    pub user_message_id: String,
    pub assistant_message_id: Option<String>,
    pub model_used: String,
    pub tokens_used: Option<TokensUsed>,
    pub latency_ms: Option<f64>,
    /// Free-form decision bag (tool_invocations, audit_artifact, ...).
    pub decision_metadata: Option<serde_json::Value>,
}

/// Result of processing a chat message through the handler chain.
#[derive(Debug, Clone)]
pub struct ChatProcessingResult {
    pub content: String,
    pub sanitized_content: String,
    pub metadata: MessageMetadata,
    pub processing_time_ms: f64,
    pub strategy_used: String,
    pub research_triggered: bool,
    pub task_id: Option<String>,
    pub session_title: Option<String>,
    pub session_updated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ChatContext {
        ChatContext {
            user_id: "u-1".to_string(),
            request_id: "r-1".to_string(),
            timestamp: Utc::now(),
            chat_id: None,
            session_id: None,
            message: "hola".to_string(),
            prior_context: None,
            model: "Saptiva Cortex".to_string(),
            channel: Channel::Chat,
            tools_enabled: HashMap::from([
                ("audit_file".to_string(), true),
                ("viz_tool".to_string(), false),
            ]),
            stream: false,
            document_ids: Vec::new(),
            tool_results: HashMap::new(),
            temperature: None,
            max_tokens: None,
            kill_switch_active: true,
        }
    }

    #[test]
    fn with_session_is_a_functional_update() {
        let ctx = context();
        let derived = ctx.with_session("s-9");
        assert_eq!(derived.session_id.as_deref(), Some("s-9"));
        assert!(ctx.session_id.is_none());
        assert_eq!(derived.message, ctx.message);
    }

    #[test]
    fn enabled_tools_filters_and_sorts() {
        let ctx = context();
        assert_eq!(ctx.enabled_tools(), vec!["audit_file".to_string()]);
    }

    #[test]
    fn channel_parse_roundtrip() {
        for ch in ["chat", "report", "title", "summary", "code"] {
            let parsed: Channel = ch.parse().expect("parse");
            assert_eq!(parsed.as_str(), ch);
        }
        assert!("video".parse::<Channel>().is_err());
    }

    #[test]
    fn tokens_total_is_sum() {
        let t = TokensUsed::new(100, 20);
        assert_eq!(t.total, 120);
    }
}
