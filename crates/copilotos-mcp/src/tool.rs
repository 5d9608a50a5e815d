use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::spec::ToolSpec;

/// Invocation context populated by the HTTP adapter or the task executor.
///
/// `user_id` is a first-class field: tools never reach into the payload
/// for caller identity.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub request_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub scopes: HashSet<String>,
    /// Caller surface: "api", "chat", "task", "warmup".
    pub source: String,
    /// Cooperative cancellation, triggered by the task executor when a
    /// DELETE arrives. Long-running tools poll it at checkpoints.
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(request_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            session_id: None,
            scopes: HashSet::new(),
            source: "api".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_scopes(mut self, scopes: HashSet<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle the task executor uses to signal cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Structured error a tool surfaces to the invoker.
#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub details: Value,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            details: Value::Null,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new("invalid_payload", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ToolError {}

/// Trait every MCP tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Public metadata for discovery. Name and version here drive registry
    /// placement.
    fn spec(&self) -> ToolSpec;

    /// Execute with a JSON payload. Input validation belongs to the tool;
    /// the invoker has already enforced size/structure/scope/rate gates.
    async fn invoke(&self, payload: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Tool")
            .field("spec", &self.spec())
            .finish()
    }
}
