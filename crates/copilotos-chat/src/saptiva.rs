use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use copilotos_core::config::SaptivaConfig;
use copilotos_core::types::TokensUsed;
use copilotos_core::{ApiError, Result};

/// A single message in the upstream request array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaptivaMessage {
    pub role: String,
    pub content: String,
}

impl SaptivaMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Generation parameters forwarded upstream.
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub max_tokens: u32,
}

/// Completed (non-streaming) exchange.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub tokens: TokensUsed,
    pub finish_reason: String,
}

/// Event stream shared by the sync and streaming paths: a series of
/// `Chunk`s closed by `Final`, or a single `Final` in non-streaming mode.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Chunk {
        delta: String,
    },
    Final {
        content: String,
        model: String,
        tokens: TokensUsed,
    },
    Error {
        message: String,
    },
}

/// HTTP client for the Saptiva completion API (OpenAI-shaped).
///
/// Timeouts: connect bound at the pool, total request bound for
/// non-streaming calls, and a whole-read deadline wrapping the SSE loop
/// for streaming. Mock mode serves canned deterministic responses; with
/// `allow_mock_fallback` a dead upstream flips the client into mock mode
/// instead of failing chats.
pub struct SaptivaClient {
    client: reqwest::Client,
    config: SaptivaConfig,
    mock_active: AtomicBool,
}

impl SaptivaClient {
    pub fn new(config: SaptivaConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(config.connect_timeout_secs))
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_default();
        let mock_active = AtomicBool::new(config.force_mock);
        if config.force_mock {
            info!("saptiva client starting in mock mode");
        }
        Self {
            client,
            config,
            mock_active,
        }
    }

    pub fn is_mock(&self) -> bool {
        self.mock_active.load(Ordering::Relaxed)
    }

    fn enable_mock(&self, reason: &str) {
        warn!(reason, "enabling saptiva mock fallback");
        self.mock_active.store(true, Ordering::Relaxed);
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
        stream: bool,
    ) -> serde_json::Value {
        json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "presence_penalty": params.presence_penalty,
            "frequency_penalty": params.frequency_penalty,
            "max_tokens": params.max_tokens,
            "stream": stream,
        })
    }

    /// Non-streaming completion under the total timeout.
    pub async fn chat_completion(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
    ) -> Result<ChatCompletion> {
        if self.is_mock() {
            return Ok(self.mock_completion(messages, model, params));
        }

        let total = Duration::from_secs(self.config.timeout_secs);
        let send = self.send_completion(messages, model, params);
        match tokio::time::timeout(total, send).await {
            Err(_) => {
                warn!(secs = self.config.timeout_secs, "saptiva completion timed out");
                Err(ApiError::UpstreamTimeout {
                    secs: self.config.timeout_secs,
                })
            }
            Ok(Err(e)) if self.config.allow_mock_fallback => {
                self.enable_mock(&e.to_string());
                Ok(self.mock_completion(messages, model, params))
            }
            Ok(result) => result,
        }
    }

    async fn send_completion(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
    ) -> Result<ChatCompletion> {
        let body = self.request_body(messages, model, params, false);
        debug!(model, messages = messages.len(), "sending saptiva completion");

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Execution(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ApiError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "saptiva API error");
            return Err(ApiError::Execution(format!("saptiva API {status}: {text}")));
        }

        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Execution(format!("saptiva parse error: {e}")))?;
        Ok(parse_response(api, model))
    }

    /// Streaming completion: chunks then a final event, sent through `tx`.
    /// The whole read loop runs under the read deadline; on expiry the
    /// caller observes `UpstreamTimeout` (surfaced as 504).
    pub async fn chat_completion_stream(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
        tx: mpsc::Sender<LlmEvent>,
    ) -> Result<()> {
        if self.is_mock() {
            return self.mock_stream(messages, model, params, tx).await;
        }

        let deadline = Duration::from_secs_f64(self.config.read_timeout_secs);
        let run = self.send_stream(messages, model, params, tx);
        match tokio::time::timeout(deadline, run).await {
            Err(_) => {
                warn!(secs = self.config.read_timeout_secs, "saptiva stream timed out");
                Err(ApiError::UpstreamTimeout {
                    secs: self.config.read_timeout_secs as u64,
                })
            }
            Ok(result) => result,
        }
    }

    async fn send_stream(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
        tx: mpsc::Sender<LlmEvent>,
    ) -> Result<()> {
        use futures_util::StreamExt;

        let body = self.request_body(messages, model, params, true);
        debug!(model, "sending saptiva streaming completion");

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Execution(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Execution(format!("saptiva API {status}: {text}")));
        }

        let mut content = String::new();
        let mut tokens = TokensUsed::default();
        let mut line_buf = String::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(LlmEvent::Error { message: e.to_string() }).await;
                    return Err(ApiError::Execution(e.to_string()));
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };

            // SSE frames arrive split across chunks; keep the incomplete
            // trailing line in the buffer.
            line_buf.push_str(text);
            let lines: Vec<&str> = line_buf.split('\n').collect();
            let (complete, remainder) = lines.split_at(lines.len() - 1);
            let remainder = remainder.first().unwrap_or(&"").to_string();

            for line in complete {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    break;
                }
                let Ok(frame) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                if let Some(usage) = &frame.usage {
                    tokens = TokensUsed::new(usage.prompt_tokens, usage.completion_tokens);
                }
                for choice in &frame.choices {
                    if let Some(delta) = &choice.delta.content {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            // Receiver dropped means the client went away;
                            // stop reading at the next chunk boundary.
                            if tx.send(LlmEvent::Chunk { delta: delta.clone() }).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            line_buf = remainder;
        }

        let _ = tx
            .send(LlmEvent::Final {
                content,
                model: model.to_string(),
                tokens,
            })
            .await;
        Ok(())
    }

    /// Unified entry point: one receiver for both modes. Non-streaming
    /// yields a single `Final`; streaming yields chunks then `Final`.
    pub async fn chat_completion_or_stream(
        self: std::sync::Arc<Self>,
        messages: Vec<SaptivaMessage>,
        model: String,
        params: CompletionParams,
        stream: bool,
    ) -> mpsc::Receiver<LlmEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self;
        tokio::spawn(async move {
            if stream {
                if let Err(e) = client
                    .chat_completion_stream(&messages, &model, params, tx.clone())
                    .await
                {
                    let _ = tx.send(LlmEvent::Error { message: e.to_string() }).await;
                }
            } else {
                match client.chat_completion(&messages, &model, params).await {
                    Ok(completion) => {
                        let _ = tx
                            .send(LlmEvent::Final {
                                content: completion.content,
                                model: completion.model,
                                tokens: completion.tokens,
                            })
                            .await;
                    }
                    Err(e) => {
                        let _ = tx.send(LlmEvent::Error { message: e.to_string() }).await;
                    }
                }
            }
        });
        rx
    }

    pub async fn health_check(&self) -> bool {
        if self.is_mock() {
            return true;
        }
        let url = format!("{}/v1/models", self.config.base_url.trim_end_matches('/'));
        match self.client.get(url).bearer_auth(&self.config.api_key).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // ── mock mode ───────────────────────────────────────────────────────

    fn mock_completion(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
    ) -> ChatCompletion {
        let user_message = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let content = mock_content(user_message, params.max_tokens);
        let prompt_tokens: u32 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        ChatCompletion {
            tokens: TokensUsed::new(prompt_tokens, estimate_tokens(&content)),
            content,
            model: model.to_string(),
            finish_reason: "stop".to_string(),
        }
    }

    async fn mock_stream(
        &self,
        messages: &[SaptivaMessage],
        model: &str,
        params: CompletionParams,
        tx: mpsc::Sender<LlmEvent>,
    ) -> Result<()> {
        let completion = self.mock_completion(messages, model, params);
        for word in completion.content.split_inclusive(' ') {
            if tx.send(LlmEvent::Chunk { delta: word.to_string() }).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx
            .send(LlmEvent::Final {
                content: completion.content,
                model: completion.model,
                tokens: completion.tokens,
            })
            .await;
        Ok(())
    }
}

/// Deterministic canned reply, trimmed to the channel budget.
fn mock_content(user_message: &str, max_tokens: u32) -> String {
    let base = format!(
        "Respuesta simulada de Saptiva. Recibí tu mensaje: \"{}\". \
         Esta respuesta proviene del modo de prueba sin conexión.",
        user_message.chars().take(120).collect::<String>()
    );
    let budget_chars = (max_tokens as usize) * 4;
    if base.len() > budget_chars {
        base.chars().take(budget_chars).collect()
    } else {
        base
    }
}

/// Rough 4-chars-per-token estimate, enough for mock usage numbers.
fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

fn parse_response(resp: ApiResponse, requested_model: &str) -> ChatCompletion {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();
    let tokens = resp
        .usage
        .map(|u| TokensUsed::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();
    ChatCompletion {
        content,
        model: if resp.model.is_empty() {
            requested_model.to_string()
        } else {
            resp.model
        },
        tokens,
        finish_reason,
    }
}

// Saptiva API wire types (deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mock_client() -> Arc<SaptivaClient> {
        let config = SaptivaConfig {
            force_mock: true,
            ..SaptivaConfig::default()
        };
        Arc::new(SaptivaClient::new(config))
    }

    fn params(max_tokens: u32) -> CompletionParams {
        CompletionParams {
            temperature: 0.3,
            top_p: 0.9,
            presence_penalty: 0.0,
            frequency_penalty: 0.2,
            max_tokens,
        }
    }

    #[tokio::test]
    async fn mock_completion_is_deterministic() {
        let client = mock_client();
        let messages = vec![SaptivaMessage::new("user", "Dame 2 puntos sobre IA")];
        let a = client.chat_completion(&messages, "Saptiva Cortex", params(1200)).await.expect("a");
        let b = client.chat_completion(&messages, "Saptiva Cortex", params(1200)).await.expect("b");
        assert_eq!(a.content, b.content);
        assert!(a.content.contains("Dame 2 puntos sobre IA"));
        assert!(a.tokens.total > 0);
    }

    #[tokio::test]
    async fn title_budget_bounds_mock_output() {
        let client = mock_client();
        let messages = vec![SaptivaMessage::new("user", "x".repeat(500))];
        let completion = client
            .chat_completion(&messages, "Saptiva Cortex", params(64))
            .await
            .expect("completion");
        assert!(completion.tokens.completion <= 64);
    }

    #[tokio::test]
    async fn unified_nonstream_yields_single_final() {
        let client = mock_client();
        let mut rx = Arc::clone(&client)
            .chat_completion_or_stream(
                vec![SaptivaMessage::new("user", "hola")],
                "Saptiva Cortex".to_string(),
                params(1200),
                false,
            )
            .await;
        let first = rx.recv().await.expect("event");
        assert!(matches!(first, LlmEvent::Final { .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unified_stream_yields_chunks_then_final() {
        let client = mock_client();
        let mut rx = Arc::clone(&client)
            .chat_completion_or_stream(
                vec![SaptivaMessage::new("user", "hola mundo")],
                "Saptiva Cortex".to_string(),
                params(1200),
                true,
            )
            .await;

        let mut chunks = 0;
        let mut streamed = String::new();
        let mut final_content = None;
        while let Some(event) = rx.recv().await {
            match event {
                LlmEvent::Chunk { delta } => {
                    chunks += 1;
                    streamed.push_str(&delta);
                }
                LlmEvent::Final { content, .. } => final_content = Some(content),
                LlmEvent::Error { message } => panic!("unexpected error: {message}"),
            }
        }
        assert!(chunks > 1);
        assert_eq!(final_content.expect("final"), streamed);
    }
}
