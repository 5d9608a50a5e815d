use async_trait::async_trait;
use tracing::info;

use copilotos_core::types::{ChatContext, ChatProcessingResult, MessageMetadata};
use copilotos_core::Result;

use crate::sanitizer::sanitize_response_content;
use crate::service::ChatService;

/// Pluggable chat-processing strategy.
#[async_trait]
pub trait ChatStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &ChatContext, service: &ChatService)
        -> Result<ChatProcessingResult>;
}

/// Direct Saptiva inference, optionally grounded on attached documents.
/// This is the strategy behind every standard chat interaction.
pub struct SimpleChatStrategy;

#[async_trait]
impl ChatStrategy for SimpleChatStrategy {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn process(
        &self,
        ctx: &ChatContext,
        service: &ChatService,
    ) -> Result<ChatProcessingResult> {
        let started = std::time::Instant::now();

        let document_context = if ctx.document_ids.is_empty() {
            None
        } else {
            let extraction = service
                .docs()
                .build_rag_context(&ctx.document_ids, &ctx.user_id);
            if extraction.combined.is_empty() {
                info!(
                    requested = ctx.document_ids.len(),
                    "no accessible documents found in cache"
                );
                None
            } else {
                info!(
                    docs_used = extraction.docs_used,
                    context_chars = extraction.combined.len(),
                    "document context attached"
                );
                Some(extraction.combined)
            }
        };

        let chat_id = ctx.session_id.clone().unwrap_or_default();
        let exchange = service
            .process_with_saptiva(
                &ctx.message,
                &ctx.model,
                &ctx.user_id,
                &chat_id,
                ctx.channel,
                &ctx.tools_enabled,
                document_context.as_deref(),
            )
            .await?;

        let sanitized = sanitize_response_content(&exchange.content);
        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(ChatProcessingResult {
            sanitized_content: sanitized,
            metadata: MessageMetadata {
                message_id: String::new(),
                chat_id,
                user_message_id: String::new(),
                assistant_message_id: None,
                model_used: exchange.model.clone(),
                tokens_used: Some(exchange.tokens),
                latency_ms: Some(exchange.latency_ms),
                decision_metadata: Some(serde_json::json!({
                    "system_hash": exchange.system_hash,
                })),
            },
            content: exchange.content,
            processing_time_ms,
            strategy_used: self.name().to_string(),
            research_triggered: false,
            task_id: None,
            session_title: None,
            session_updated: false,
        })
    }
}
