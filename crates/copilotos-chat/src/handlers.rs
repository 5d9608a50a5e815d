use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use copilotos_core::types::{ChatContext, ChatProcessingResult, MessageMetadata};
use copilotos_core::{ApiError, Result};
use copilotos_mcp::{InvokeRequest, McpInvoker, ToolContext};

use crate::sanitizer::sanitize_response_content;
use crate::service::ChatService;
use crate::strategy::{ChatStrategy, SimpleChatStrategy};

/// A handler in the chain. The first handler whose `can_handle` answers
/// true owns the message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn can_handle(&self, ctx: &ChatContext) -> bool;

    async fn process(&self, ctx: &ChatContext, service: &ChatService)
        -> Result<ChatProcessingResult>;
}

/// Ordered handler list. Specialized handlers come first; the terminal
/// standard handler accepts everything, so dispatch always resolves.
pub struct HandlerChain {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerChain {
    /// Chain with only the standard handler.
    pub fn standard() -> Self {
        Self {
            handlers: vec![Arc::new(StandardChatHandler::new())],
        }
    }

    /// Full chain. The audit handler only registers when its dependency
    /// (the MCP invoker) is available; otherwise the chain reduces to the
    /// standard handler.
    pub fn with_dependencies(invoker: Option<Arc<McpInvoker>>) -> Self {
        let mut handlers: Vec<Arc<dyn MessageHandler>> = Vec::new();
        match invoker {
            Some(invoker) => {
                handlers.push(Arc::new(AuditCommandHandler::new(invoker)));
                info!("audit handler registered in chain");
            }
            None => {
                info!("running without audit handler");
            }
        }
        handlers.push(Arc::new(StandardChatHandler::new()));
        Self { handlers }
    }

    pub async fn handle(
        &self,
        ctx: &ChatContext,
        service: &ChatService,
    ) -> Result<ChatProcessingResult> {
        for handler in &self.handlers {
            if handler.can_handle(ctx).await {
                info!(handler = handler.name(), "handler selected");
                return handler.process(ctx, service).await;
            }
        }
        // Unreachable while StandardChatHandler terminates the chain.
        Err(ApiError::Internal("no handler accepted the message".to_string()))
    }
}

/// Terminal handler: delegates every message to the simple strategy.
pub struct StandardChatHandler {
    strategy: SimpleChatStrategy,
}

impl StandardChatHandler {
    pub fn new() -> Self {
        Self {
            strategy: SimpleChatStrategy,
        }
    }
}

impl Default for StandardChatHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for StandardChatHandler {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn can_handle(&self, _ctx: &ChatContext) -> bool {
        true
    }

    async fn process(
        &self,
        ctx: &ChatContext,
        service: &ChatService,
    ) -> Result<ChatProcessingResult> {
        self.strategy.process(ctx, service).await
    }
}

/// Fixed command prefix the audit handler matches.
pub const AUDIT_COMMAND_PREFIX: &str = "Auditar archivo:";

/// Intercepts `Auditar archivo: <doc>` commands and runs the audit tool
/// through the MCP pipeline instead of the LLM.
pub struct AuditCommandHandler {
    invoker: Arc<McpInvoker>,
}

impl AuditCommandHandler {
    pub fn new(invoker: Arc<McpInvoker>) -> Self {
        Self { invoker }
    }

    /// Attached document first, command remainder second.
    fn target_doc(ctx: &ChatContext) -> Option<String> {
        if let Some(doc) = ctx.document_ids.first() {
            return Some(doc.clone());
        }
        let remainder = ctx.message.trim().strip_prefix(AUDIT_COMMAND_PREFIX)?;
        let doc = remainder.trim();
        (!doc.is_empty()).then(|| doc.to_string())
    }
}

#[async_trait]
impl MessageHandler for AuditCommandHandler {
    fn name(&self) -> &'static str {
        "audit_command"
    }

    async fn can_handle(&self, ctx: &ChatContext) -> bool {
        ctx.message.trim_start().starts_with(AUDIT_COMMAND_PREFIX)
    }

    async fn process(
        &self,
        ctx: &ChatContext,
        _service: &ChatService,
    ) -> Result<ChatProcessingResult> {
        let started = std::time::Instant::now();

        let Some(doc_id) = Self::target_doc(ctx) else {
            return Err(ApiError::InvalidInput(
                "Indica el documento a auditar: adjúntalo o escribe 'Auditar archivo: <id>'"
                    .to_string(),
            ));
        };

        // Chat-surface invocations act with the default authenticated
        // scope set; per-tool gates still apply inside the pipeline.
        let tool_ctx = ToolContext::new(ctx.request_id.clone(), ctx.user_id.clone())
            .with_scopes(HashSet::from(["mcp:tools.*".to_string()]))
            .with_source("chat");
        let response = self
            .invoker
            .invoke(
                InvokeRequest {
                    tool: "audit_file".to_string(),
                    version: None,
                    payload: json!({
                        "doc_id": doc_id,
                        "chat_id": ctx.session_id.clone().unwrap_or_default(),
                    }),
                    idempotency_key: None,
                },
                &tool_ctx,
            )
            .await;

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !response.success {
            let error = response.error.expect("failed invoke carries error");
            warn!(code = %error.code, "audit command failed");
            return Err(ApiError::Execution(format!(
                "La auditoría no pudo completarse: {}",
                error.message
            )));
        }

        let result = response.result.unwrap_or_default();
        let total = result["total_findings"].as_u64().unwrap_or(0);
        let summary = result["summary"].as_str().unwrap_or("").to_string();
        let content = format!(
            "## Reporte de auditoría\n\nDocumento: `{doc_id}`\nHallazgos: **{total}**\n\n{summary}"
        );
        let artifact = json!({
            "type": "audit_report",
            "doc_id": doc_id,
            "report": result,
        });

        Ok(ChatProcessingResult {
            sanitized_content: sanitize_response_content(&content),
            metadata: MessageMetadata {
                message_id: String::new(),
                chat_id: ctx.session_id.clone().unwrap_or_default(),
                user_message_id: String::new(),
                assistant_message_id: None,
                model_used: "audit".to_string(),
                tokens_used: None,
                latency_ms: Some(processing_time_ms),
                decision_metadata: Some(json!({
                    "audit_artifact": artifact,
                    "tool_invocations": [{
                        "tool": "audit_file",
                        "invocation_id": response.invocation_id,
                        "duration_ms": response.duration_ms,
                        "cached": response.cached,
                    }],
                })),
            },
            content,
            processing_time_ms,
            strategy_used: "audit_command".to_string(),
            research_triggered: false,
            task_id: None,
            session_title: None,
            session_updated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn context(message: &str) -> ChatContext {
        ChatContext {
            user_id: "u-1".to_string(),
            request_id: "r-1".to_string(),
            timestamp: Utc::now(),
            chat_id: None,
            session_id: Some("s-1".to_string()),
            message: message.to_string(),
            prior_context: None,
            model: "Saptiva Cortex".to_string(),
            channel: copilotos_core::types::Channel::Chat,
            tools_enabled: HashMap::new(),
            stream: false,
            document_ids: vec![],
            tool_results: HashMap::new(),
            temperature: None,
            max_tokens: None,
            kill_switch_active: true,
        }
    }

    #[tokio::test]
    async fn standard_handler_accepts_everything() {
        let handler = StandardChatHandler::new();
        assert!(handler.can_handle(&context("hola")).await);
        assert!(handler.can_handle(&context("Auditar archivo: x")).await);
    }

    #[tokio::test]
    async fn audit_prefix_matching() {
        let cache = Arc::new(copilotos_core::cache::MemoryCache::new());
        let registry = Arc::new(copilotos_mcp::tools::builtin_registry(Arc::clone(&cache)));
        let invoker = Arc::new(McpInvoker::new(
            registry,
            Arc::new(copilotos_mcp::security::RateLimiter::new()),
            Arc::new(copilotos_mcp::cache::ToolResultCache::new(cache)),
            copilotos_mcp::RateLimitConfig {
                calls_per_minute: 60,
                calls_per_hour: 600,
            },
            1024,
        ));
        let handler = AuditCommandHandler::new(invoker);

        assert!(handler.can_handle(&context("Auditar archivo: doc-1")).await);
        assert!(!handler.can_handle(&context("audita mi archivo")).await);
    }

    #[test]
    fn target_doc_prefers_attachment() {
        let mut ctx = context("Auditar archivo: doc-en-texto");
        ctx.document_ids = vec!["doc-adjunto".to_string()];
        assert_eq!(
            AuditCommandHandler::target_doc(&ctx).as_deref(),
            Some("doc-adjunto")
        );

        let ctx = context("Auditar archivo: doc-en-texto");
        assert_eq!(
            AuditCommandHandler::target_doc(&ctx).as_deref(),
            Some("doc-en-texto")
        );

        let ctx = context("Auditar archivo:");
        assert!(AuditCommandHandler::target_doc(&ctx).is_none());
    }
}
