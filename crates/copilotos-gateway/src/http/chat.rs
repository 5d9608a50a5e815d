use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use copilotos_chat::{ChatResponseBuilder, LlmEvent};
use copilotos_core::types::{Channel, ChatContext};
use copilotos_core::ApiError;

use crate::app::AppState;
use crate::middleware::AuthUser;
use crate::problem::{ApiProblem, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub model: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub tools_enabled: Option<HashMap<String, bool>>,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    fn into_context(self, auth: &AuthUser, kill_switch: bool) -> Result<ChatContext, ApiError> {
        if self.message.trim().is_empty() {
            return Err(ApiError::MissingField {
                field: "message".to_string(),
            });
        }
        // Unknown channel strings fall back to the chat budget.
        let channel: Channel = self
            .channel
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or_default();
        Ok(ChatContext {
            user_id: auth.user_id.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            chat_id: self.chat_id,
            session_id: None,
            message: self.message,
            prior_context: None,
            model: self.model,
            channel,
            tools_enabled: self.tools_enabled.unwrap_or_default(),
            stream: self.stream.unwrap_or(false),
            document_ids: self.document_ids.unwrap_or_default(),
            tool_results: HashMap::new(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            kill_switch_active: kill_switch,
        })
    }
}

/// POST /api/chat — the main orchestration endpoint.
///
/// Non-streaming requests run the handler chain and return the builder
/// body; `stream: true` switches to SSE over the same pipeline.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    let streaming = req.stream.unwrap_or(false);
    let ctx = req
        .into_context(&auth, state.config.research.kill_switch)
        .map_err(ApiProblem)?;

    if streaming {
        return Ok(sse_response(&state, ctx).await?);
    }

    info!(model = %ctx.model, user_id = %ctx.user_id, "processing chat message");
    let result = state.chat.handle_message(ctx, &state.chain).await?;

    let (body, headers) = ChatResponseBuilder::new()
        .from_processing_result(&result)
        .build();
    let mut response = Json(body).into_response();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name),
            axum::http::HeaderValue::try_from(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

/// POST /api/stream — SSE variant of the chat endpoint.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    let ctx = req
        .into_context(&auth, state.config.research.kill_switch)
        .map_err(ApiProblem)?;
    sse_response(&state, ctx).await.map_err(Into::into)
}

async fn sse_response(state: &Arc<AppState>, ctx: ChatContext) -> Result<Response, ApiProblem> {
    let (chat_id, rx) = state.chat.stream_message(ctx).await?;
    info!(chat_id = %chat_id, "streaming chat started");

    let stream = ReceiverStream::new(rx).map(move |event| -> Result<Event, Infallible> {
        let payload = match event {
            LlmEvent::Chunk { delta } => json!({ "type": "chunk", "delta": delta }),
            LlmEvent::Final { content, model, tokens } => json!({
                "type": "final",
                "content": content,
                "model": model,
                "chat_id": chat_id.clone(),
                "tokens": { "prompt": tokens.prompt, "completion": tokens.completion, "total": tokens.total },
            }),
            LlmEvent::Error { message } => json!({ "type": "error", "message": message }),
        };
        Ok(Event::default().data(payload.to_string()))
    });

    Ok(Sse::new(stream)
        .keep_alive(axum::response::sse::KeepAlive::default())
        .into_response())
}
