use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use copilotos_core::types::{Channel, ChatContext, TokensUsed};
use copilotos_core::{ApiError, Result};
use copilotos_mcp::registry::ToolRegistry;
use copilotos_prompts::{PromptError, PromptRegistry, ResolvedParams};
use copilotos_sessions::{ChatSession, NewMessage, SessionStore};

use crate::context::DocumentContextCache;
use crate::handlers::HandlerChain;
use crate::sanitizer::sanitize_response_content;
use crate::saptiva::{CompletionParams, LlmEvent, SaptivaClient, SaptivaMessage};

/// How many prior turns are replayed to the model.
const PRIOR_CONTEXT_MESSAGES: usize = 20;

/// Outcome of one upstream exchange.
#[derive(Debug, Clone)]
pub struct SaptivaExchange {
    pub content: String,
    pub model: String,
    pub tokens: TokensUsed,
    pub latency_ms: f64,
    pub system_hash: String,
}

/// Orchestrates a chat turn: session resolution, prompt resolution, prior
/// context, the upstream call, sanitization and persistence ordering
/// (user message before assistant message within a session).
pub struct ChatService {
    registry: Arc<PromptRegistry>,
    client: Arc<SaptivaClient>,
    store: Arc<SessionStore>,
    docs: DocumentContextCache,
    tools: Arc<ToolRegistry>,
    enable_model_system_prompt: bool,
}

impl ChatService {
    pub fn new(
        registry: Arc<PromptRegistry>,
        client: Arc<SaptivaClient>,
        store: Arc<SessionStore>,
        docs: DocumentContextCache,
        tools: Arc<ToolRegistry>,
        enable_model_system_prompt: bool,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            docs,
            tools,
            enable_model_system_prompt,
        }
    }

    pub fn docs(&self) -> &DocumentContextCache {
        &self.docs
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<SaptivaClient> {
        &self.client
    }

    /// Markdown block describing the enabled tools, injected at `{TOOLS}`.
    pub fn tools_markdown(&self, tools_enabled: &HashMap<String, bool>) -> Option<String> {
        let mut enabled: Vec<String> = tools_enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect();
        enabled.sort();
        if enabled.is_empty() {
            return None;
        }

        let specs = self.tools.list_specs();
        let lines: Vec<String> = enabled
            .iter()
            .filter_map(|name| {
                specs
                    .iter()
                    .find(|s| &s.name == name)
                    .map(|s| format!("- **{}** (`{}`): {}", s.display_name, s.name, s.description))
            })
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// Resolve `(system_text, params)` for this request's channel.
    pub fn resolve_prompt(
        &self,
        model: &str,
        tools_markdown: Option<&str>,
        channel: Channel,
    ) -> Result<(String, ResolvedParams)> {
        let model_key = if self.enable_model_system_prompt {
            model
        } else {
            "default"
        };
        self.registry
            .resolve(model_key, tools_markdown, channel)
            .map_err(map_prompt_error)
    }

    /// Prior conversation turns, oldest first, ready for the message array.
    fn prior_context(&self, chat_id: &str, user_id: &str) -> Vec<SaptivaMessage> {
        let mut history = self
            .store
            .get_messages(chat_id, user_id, PRIOR_CONTEXT_MESSAGES, 0, false, None)
            .unwrap_or_default();
        history.reverse();
        history
            .into_iter()
            .map(|m| SaptivaMessage::new(m.role, m.content))
            .collect()
    }

    /// Assemble the message array and call the upstream completion API.
    ///
    /// Array shape: `[system, …prior turns, user (+document context)]`.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_with_saptiva(
        &self,
        message: &str,
        model: &str,
        user_id: &str,
        chat_id: &str,
        channel: Channel,
        tools_enabled: &HashMap<String, bool>,
        document_context: Option<&str>,
    ) -> Result<SaptivaExchange> {
        let tools_md = self.tools_markdown(tools_enabled);
        let (system_text, params) = self.resolve_prompt(model, tools_md.as_deref(), channel)?;

        let mut messages = vec![SaptivaMessage::new("system", system_text)];
        if !chat_id.is_empty() {
            messages.extend(self.prior_context(chat_id, user_id));
        }
        let user_content = match document_context {
            Some(ctx) if !ctx.is_empty() => {
                format!("{message}\n\nContexto de documentos adjuntos:\n{ctx}")
            }
            _ => message.to_string(),
        };
        messages.push(SaptivaMessage::new("user", user_content));

        let started = Instant::now();
        let completion = self
            .client
            .chat_completion(&messages, model, completion_params(&params))
            .await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            model,
            tokens_in = completion.tokens.prompt,
            tokens_out = completion.tokens.completion,
            latency_ms,
            system_hash = %params.metadata.system_hash,
            "saptiva exchange complete"
        );

        Ok(SaptivaExchange {
            content: completion.content,
            model: completion.model,
            tokens: completion.tokens,
            latency_ms,
            system_hash: params.metadata.system_hash,
        })
    }

    /// Resolve (or create) the session for this request. New sessions get
    /// an auto-generated title from the first message.
    async fn resolve_session(&self, ctx: &ChatContext) -> Result<(ChatSession, bool)> {
        if let Some(chat_id) = &ctx.chat_id {
            let session = self
                .store
                .get_session(chat_id)
                .map_err(map_session_error)?
                .ok_or_else(|| ApiError::NotFound(format!("sesión {chat_id}")))?;
            if session.user_id != ctx.user_id {
                return Err(ApiError::PermissionDenied {
                    reason: "la sesión pertenece a otro usuario".to_string(),
                });
            }
            return Ok((session, false));
        }

        let title = self.generate_session_title(&ctx.message, &ctx.model).await;
        let session = self
            .store
            .create_session(&ctx.user_id, Some(&title))
            .map_err(map_session_error)?;
        Ok((session, true))
    }

    /// Short session title via the `title` channel budget; falls back to
    /// truncating the message when the upstream call fails.
    async fn generate_session_title(&self, message: &str, model: &str) -> String {
        let fallback = || {
            let mut title: String = message.chars().take(60).collect();
            if message.chars().count() > 60 {
                title.push('…');
            }
            title
        };

        let Ok((system_text, params)) = self.resolve_prompt(model, None, Channel::Title) else {
            return fallback();
        };
        let messages = vec![
            SaptivaMessage::new("system", system_text),
            SaptivaMessage::new(
                "user",
                format!("Genera un título corto (máximo 6 palabras) para esta conversación: {message}"),
            ),
        ];
        match self
            .client
            .chat_completion(&messages, model, completion_params(&params))
            .await
        {
            Ok(completion) if !completion.content.trim().is_empty() => {
                completion.content.trim().trim_matches('"').to_string()
            }
            _ => fallback(),
        }
    }

    /// Full non-streaming turn: session → persist user → handler chain →
    /// persist assistant → result.
    pub async fn handle_message(
        &self,
        ctx: ChatContext,
        chain: &HandlerChain,
    ) -> Result<copilotos_core::types::ChatProcessingResult> {
        let (session, created) = self.resolve_session(&ctx).await?;
        let ctx = ctx.with_session(session.id.clone());

        // The chain reads prior context from the store, so the current user
        // turn is persisted only after processing. Write order within the
        // session stays user-then-assistant.
        let mut result = chain.handle(&ctx, self).await?;

        let user_message = self
            .store
            .append_message(&NewMessage {
                chat_id: session.id.clone(),
                user_id: ctx.user_id.clone(),
                role: "user".to_string(),
                content: ctx.message.clone(),
                model: None,
                tokens_in: 0,
                tokens_out: 0,
                task_id: None,
            })
            .map_err(map_session_error)?;

        let assistant_message = self
            .store
            .append_message(&NewMessage {
                chat_id: session.id.clone(),
                user_id: ctx.user_id.clone(),
                role: "assistant".to_string(),
                content: result.sanitized_content.clone(),
                model: Some(result.metadata.model_used.clone()),
                tokens_in: result.metadata.tokens_used.map(|t| t.prompt).unwrap_or(0),
                tokens_out: result
                    .metadata
                    .tokens_used
                    .map(|t| t.completion)
                    .unwrap_or(0),
                task_id: result.task_id.clone(),
            })
            .map_err(map_session_error)?;

        result.metadata.chat_id = session.id.clone();
        result.metadata.user_message_id = user_message.id;
        result.metadata.assistant_message_id = Some(assistant_message.id.clone());
        result.metadata.message_id = assistant_message.id;
        result.session_updated = true;
        if created {
            result.session_title = session.title.clone();
        }
        Ok(result)
    }

    /// Streaming turn. Persists the user message up front, relays chunk
    /// events, and persists the assistant message when `Final` arrives.
    /// Client disconnects drop the receiver, which ends the upstream read
    /// at the next chunk boundary.
    pub async fn stream_message(
        &self,
        ctx: ChatContext,
    ) -> Result<(String, mpsc::Receiver<LlmEvent>)> {
        let (session, _) = self.resolve_session(&ctx).await?;
        let chat_id = session.id.clone();
        let ctx = ctx.with_session(chat_id.clone());

        let document_context = if ctx.document_ids.is_empty() {
            None
        } else {
            let extraction = self.docs.build_rag_context(&ctx.document_ids, &ctx.user_id);
            (!extraction.combined.is_empty()).then_some(extraction.combined)
        };

        let tools_md = self.tools_markdown(&ctx.tools_enabled);
        let (system_text, params) =
            self.resolve_prompt(&ctx.model, tools_md.as_deref(), ctx.channel)?;

        let mut messages = vec![SaptivaMessage::new("system", system_text)];
        messages.extend(self.prior_context(&chat_id, &ctx.user_id));
        let user_content = match &document_context {
            Some(doc_ctx) => format!(
                "{}\n\nContexto de documentos adjuntos:\n{doc_ctx}",
                ctx.message
            ),
            None => ctx.message.clone(),
        };
        messages.push(SaptivaMessage::new("user", user_content));

        // Persisted after the prior-context read so the current turn is
        // not replayed twice; still written before the assistant reply.
        self.store
            .append_message(&NewMessage {
                chat_id: chat_id.clone(),
                user_id: ctx.user_id.clone(),
                role: "user".to_string(),
                content: ctx.message.clone(),
                model: None,
                tokens_in: 0,
                tokens_out: 0,
                task_id: None,
            })
            .map_err(map_session_error)?;

        let upstream = Arc::clone(&self.client)
            .chat_completion_or_stream(messages, ctx.model.clone(), completion_params(&params), true)
            .await;

        // Relay events; persist the assistant turn on Final.
        let (tx, rx) = mpsc::channel::<LlmEvent>(64);
        let store = Arc::clone(&self.store);
        let user_id = ctx.user_id.clone();
        let persist_chat_id = chat_id.clone();
        tokio::spawn(async move {
            let mut upstream = upstream;
            while let Some(event) = upstream.recv().await {
                if let LlmEvent::Final { content, model, tokens } = &event {
                    let sanitized = sanitize_response_content(content);
                    if let Err(e) = store.append_message(&NewMessage {
                        chat_id: persist_chat_id.clone(),
                        user_id: user_id.clone(),
                        role: "assistant".to_string(),
                        content: sanitized,
                        model: Some(model.clone()),
                        tokens_in: tokens.prompt,
                        tokens_out: tokens.completion,
                        task_id: None,
                    }) {
                        warn!(error = %e, "failed to persist streamed assistant message");
                    }
                }
                if tx.send(event).await.is_err() {
                    // Client disconnected; dropping the upstream receiver
                    // terminates the read loop at the next chunk.
                    break;
                }
            }
        });

        Ok((chat_id, rx))
    }

    /// Request id helper for routes that lack one.
    pub fn new_request_id() -> String {
        Uuid::new_v4().to_string()
    }
}

pub(crate) fn completion_params(params: &ResolvedParams) -> CompletionParams {
    CompletionParams {
        temperature: params.temperature,
        top_p: params.top_p,
        presence_penalty: params.presence_penalty,
        frequency_penalty: params.frequency_penalty,
        max_tokens: params.max_tokens,
    }
}

fn map_prompt_error(err: PromptError) -> ApiError {
    match err {
        PromptError::ModelNotConfigured { model } => {
            ApiError::InvalidInput(format!("modelo no configurado: {model}"))
        }
        PromptError::InvalidConfig(msg) => ApiError::Config(msg),
        PromptError::Io(e) => ApiError::Io(e),
    }
}

pub(crate) fn map_session_error(err: copilotos_sessions::SessionError) -> ApiError {
    use copilotos_sessions::SessionError;
    match err {
        SessionError::NotFound { id } => ApiError::NotFound(format!("sesión {id}")),
        SessionError::PermissionDenied { .. } => ApiError::PermissionDenied {
            reason: "la sesión pertenece a otro usuario".to_string(),
        },
        SessionError::InvalidInput(msg) => ApiError::InvalidInput(msg),
        SessionError::Database(e) => ApiError::Database(e.to_string()),
        SessionError::Serialization(e) => ApiError::Serialization(e),
    }
}
