use serde_json::{json, Map, Value};

use copilotos_core::types::ChatProcessingResult;

/// Headers attached to every chat response — replies must never be
/// cached by intermediaries.
pub const NO_STORE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-store, no-cache, must-revalidate, max-age=0"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

const AUDIT_NOTICE: &str =
    "He generado el reporte de auditoría. Puedes ver los detalles a continuación.";

/// Fluent assembly of the chat reply body.
///
/// `build()` returns the JSON body plus the no-store header set; the HTTP
/// layer turns both into the actual response.
pub struct ChatResponseBuilder {
    data: Map<String, Value>,
    metadata: Map<String, Value>,
}

impl ChatResponseBuilder {
    pub fn new() -> Self {
        let mut data = Map::new();
        data.insert("type".to_string(), json!("chat"));
        data.insert("content".to_string(), json!(""));
        data.insert("chat_id".to_string(), Value::Null);
        data.insert("message_id".to_string(), Value::Null);
        data.insert(
            "timestamp".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
        Self {
            data,
            metadata: Map::new(),
        }
    }

    pub fn with_chat_id(mut self, chat_id: &str) -> Self {
        self.data.insert("chat_id".to_string(), json!(chat_id));
        self
    }

    pub fn with_message(mut self, content: &str, sanitized: bool) -> Self {
        self.data.insert("content".to_string(), json!(content));
        if sanitized {
            self.data.insert("sanitized".to_string(), json!(true));
        }
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.data.insert("message_id".to_string(), json!(message_id));
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.data.insert("model".to_string(), json!(model));
        self
    }

    pub fn with_tokens(mut self, prompt: u32, completion: u32) -> Self {
        self.data.insert(
            "tokens".to_string(),
            json!({
                "prompt": prompt,
                "completion": completion,
                "total": prompt + completion,
            }),
        );
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.data.insert(
            "latency_ms".to_string(),
            json!((latency_ms * 100.0).round() / 100.0),
        );
        self
    }

    pub fn with_decision(mut self, decision: Value) -> Self {
        self.data.insert("decision".to_string(), decision);
        self
    }

    pub fn with_artifact(mut self, artifact: Value) -> Self {
        self.data.insert("artifact".to_string(), artifact);
        self
    }

    pub fn with_research_task(mut self, task_id: &str) -> Self {
        self.data.insert("task_id".to_string(), json!(task_id));
        self.data.insert("research_triggered".to_string(), json!(true));
        self
    }

    pub fn with_session_title(mut self, title: &str) -> Self {
        self.data.insert("session_title".to_string(), json!(title));
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_error(mut self, message: &str, code: Option<&str>) -> Self {
        self.data.insert("error".to_string(), json!(message));
        if let Some(code) = code {
            self.data.insert("error_code".to_string(), json!(code));
        }
        self
    }

    /// Populate from a processing result. When an audit artifact is
    /// present the bulky markdown body is replaced with a short notice,
    /// unless the sanitized content is already concise.
    pub fn from_processing_result(mut self, result: &ChatProcessingResult) -> Self {
        let decision = result.metadata.decision_metadata.clone();
        let audit_artifact = decision
            .as_ref()
            .and_then(|d| d.get("audit_artifact"))
            .cloned();
        let tool_invocations = decision
            .as_ref()
            .and_then(|d| d.get("tool_invocations"))
            .cloned();

        self = self.with_chat_id(&result.metadata.chat_id);
        if audit_artifact.is_some() {
            let concise = if !result.sanitized_content.is_empty()
                && result.sanitized_content.len() < 300
            {
                result.sanitized_content.as_str()
            } else {
                AUDIT_NOTICE
            };
            self = self.with_message(concise, true);
        } else {
            self = self.with_message(&result.sanitized_content, true);
        }

        self = self
            .with_message_id(result.metadata.assistant_message_id.as_deref().unwrap_or(""))
            .with_model(&result.metadata.model_used);
        if let Some(latency) = result.metadata.latency_ms {
            self = self.with_latency(latency);
        }
        if let Some(tokens) = result.metadata.tokens_used {
            self = self.with_tokens(tokens.prompt, tokens.completion);
        }
        if let Some(decision) = decision {
            self = self.with_decision(decision);
        }
        if let Some(task_id) = &result.task_id {
            self = self.with_research_task(task_id);
        }
        if let Some(title) = &result.session_title {
            self = self.with_session_title(title);
        }
        if let Some(artifact) = audit_artifact {
            self = self.with_artifact(artifact);
        }

        self = self
            .with_metadata("strategy_used", json!(result.strategy_used))
            .with_metadata("session_updated", json!(result.session_updated));
        if let Some(invocations) = tool_invocations {
            self = self.with_metadata("tool_invocations", invocations);
        }
        self
    }

    /// Final body plus the no-store header set.
    pub fn build(mut self) -> (Value, Vec<(&'static str, &'static str)>) {
        if !self.metadata.is_empty() {
            self.data
                .insert("metadata".to_string(), Value::Object(self.metadata));
        }
        (Value::Object(self.data), NO_STORE_HEADERS.to_vec())
    }
}

impl Default for ChatResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilotos_core::types::{MessageMetadata, TokensUsed};

    fn result(sanitized: &str, decision: Option<Value>) -> ChatProcessingResult {
        ChatProcessingResult {
            content: sanitized.to_string(),
            sanitized_content: sanitized.to_string(),
            metadata: MessageMetadata {
                message_id: "m-2".to_string(),
                chat_id: "c-1".to_string(),
                user_message_id: "m-1".to_string(),
                assistant_message_id: Some("m-2".to_string()),
                model_used: "Saptiva Cortex".to_string(),
                tokens_used: Some(TokensUsed::new(100, 40)),
                latency_ms: Some(123.456),
                decision_metadata: decision,
            },
            processing_time_ms: 130.0,
            strategy_used: "simple".to_string(),
            research_triggered: false,
            task_id: None,
            session_title: Some("título".to_string()),
            session_updated: true,
        }
    }

    #[test]
    fn builds_standard_body_with_no_store_headers() {
        let (body, headers) = ChatResponseBuilder::new()
            .from_processing_result(&result("Hola", None))
            .build();

        assert_eq!(body["content"], "Hola");
        assert_eq!(body["chat_id"], "c-1");
        assert_eq!(body["message_id"], "m-2");
        assert_eq!(body["tokens"]["total"], 140);
        assert_eq!(body["latency_ms"], 123.46);
        assert_eq!(body["metadata"]["strategy_used"], "simple");
        assert_eq!(body["session_title"], "título");

        let cache_control = headers
            .iter()
            .find(|(name, _)| *name == "Cache-Control")
            .expect("header");
        assert!(cache_control.1.contains("no-store"));
        assert!(headers.iter().any(|(name, _)| *name == "Pragma"));
        assert!(headers.iter().any(|(name, _)| *name == "Expires"));
    }

    #[test]
    fn long_audit_body_replaced_by_notice() {
        let long = "x".repeat(500);
        let decision = json!({ "audit_artifact": { "type": "audit_report" } });
        let (body, _) = ChatResponseBuilder::new()
            .from_processing_result(&result(&long, Some(decision)))
            .build();

        assert_eq!(body["content"], AUDIT_NOTICE);
        assert_eq!(body["artifact"]["type"], "audit_report");
    }

    #[test]
    fn short_audit_body_kept() {
        let decision = json!({ "audit_artifact": { "type": "audit_report" } });
        let (body, _) = ChatResponseBuilder::new()
            .from_processing_result(&result("Listo, 2 hallazgos.", Some(decision)))
            .build();
        assert_eq!(body["content"], "Listo, 2 hallazgos.");
    }

    #[test]
    fn latency_rounded_to_two_decimals() {
        let (body, _) = ChatResponseBuilder::new().with_latency(10.0 / 3.0).build();
        assert_eq!(body["latency_ms"], 3.33);
    }
}
