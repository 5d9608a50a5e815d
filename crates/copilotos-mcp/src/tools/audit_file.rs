use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use copilotos_core::cache::MemoryCache;
use copilotos_core::types::{extraction_cache_key, ExtractedDocument};

use crate::spec::ToolSpec;
use crate::tool::{Tool, ToolContext, ToolError};

/// A single audit finding.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Finding {
    pub auditor: String,
    pub severity: String,
    pub message: String,
    pub fragment_index: usize,
}

/// Opaque auditor plugin: a pure function from document fragments and a
/// config blob to findings plus a one-line summary.
pub trait Auditor: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, fragments: &[String], config: &Value) -> (Vec<Finding>, String);
}

/// Deterministic structural auditor that ships with the gateway so the
/// audit path is exercised without the full plugin suite: flags empty
/// fragments and fragments exceeding a length bound.
pub struct StructuralAuditor;

const MAX_FRAGMENT_CHARS: usize = 4000;

impl Auditor for StructuralAuditor {
    fn name(&self) -> &str {
        "structural"
    }

    fn run(&self, fragments: &[String], _config: &Value) -> (Vec<Finding>, String) {
        let mut findings = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            if fragment.trim().is_empty() {
                findings.push(Finding {
                    auditor: self.name().to_string(),
                    severity: "warning".to_string(),
                    message: "Fragmento vacío en el documento".to_string(),
                    fragment_index: i,
                });
            } else if fragment.len() > MAX_FRAGMENT_CHARS {
                findings.push(Finding {
                    auditor: self.name().to_string(),
                    severity: "info".to_string(),
                    message: format!(
                        "Fragmento excede {MAX_FRAGMENT_CHARS} caracteres ({})",
                        fragment.len()
                    ),
                    fragment_index: i,
                });
            }
        }
        let summary = format!(
            "Revisión estructural: {} hallazgos en {} fragmentos",
            findings.len(),
            fragments.len()
        );
        (findings, summary)
    }
}

#[derive(Debug, Deserialize)]
struct AuditFileInput {
    doc_id: String,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default = "default_policy")]
    policy_id: String,
    #[serde(default = "bool_true")]
    enable_disclaimer: bool,
    #[serde(default = "bool_true")]
    enable_format: bool,
    #[serde(default = "bool_true")]
    enable_grammar: bool,
    #[serde(default = "bool_true")]
    enable_logo: bool,
}

fn default_policy() -> String {
    "auto".to_string()
}
fn bool_true() -> bool {
    true
}

/// Audits a document's extracted text with the configured auditor set.
pub struct AuditFileTool {
    auditors: Vec<Arc<dyn Auditor>>,
    extraction_cache: Arc<MemoryCache>,
}

impl AuditFileTool {
    pub fn new(auditors: Vec<Arc<dyn Auditor>>, extraction_cache: Arc<MemoryCache>) -> Self {
        Self {
            auditors,
            extraction_cache,
        }
    }

    pub fn with_default_auditors(extraction_cache: Arc<MemoryCache>) -> Self {
        Self::new(vec![Arc::new(StructuralAuditor)], extraction_cache)
    }

    /// Page-sized fragments the auditors consume.
    fn fragment(text: &str) -> Vec<String> {
        text.split("\n\n").map(|s| s.to_string()).collect()
    }
}

#[async_trait]
impl Tool for AuditFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "audit_file".to_string(),
            version: "1.0.0".to_string(),
            display_name: "Auditoría de documentos".to_string(),
            description: "Audita un documento y publica el reporte de hallazgos en el chat."
                .to_string(),
            category: "audit".to_string(),
            capabilities: vec![
                "documents".to_string(),
                "compliance".to_string(),
                "chat-response".to_string(),
            ],
            input_schema: json!({
                "type": "object",
                "required": ["doc_id"],
                "properties": {
                    "doc_id": { "type": "string", "description": "Documento a auditar" },
                    "chat_id": { "type": "string", "description": "Chat que recibe el reporte" },
                    "policy_id": { "type": "string", "default": "auto" },
                    "enable_disclaimer": { "type": "boolean", "default": true },
                    "enable_format": { "type": "boolean", "default": true },
                    "enable_grammar": { "type": "boolean", "default": true },
                    "enable_logo": { "type": "boolean", "default": true },
                    "user_id": { "type": "string" }
                }
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "job_id": { "type": "string" },
                    "validation_report_id": { "type": "string" },
                    "policy_used": { "type": "string" },
                    "total_findings": { "type": "integer" },
                    "findings": { "type": "array" },
                    "summary": { "type": "string" },
                    "duration_ms": { "type": "integer" },
                    "status": { "type": "string" }
                }
            }),
            tags: vec!["audit".to_string(), "pdf".to_string()],
            owner: "copilot-os".to_string(),
            rate_limit: None,
            timeout_ms: 180_000,
            max_payload_kb: 8,
            requires_auth: true,
        }
    }

    async fn invoke(&self, payload: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if ctx.user_id.is_empty() {
            return Err(ToolError::unauthorized(
                "authenticated user required for audit",
            ));
        }

        let input: AuditFileInput = serde_json::from_value(payload)
            .map_err(|e| ToolError::invalid_payload(e.to_string()))?;

        let doc: ExtractedDocument = self
            .extraction_cache
            .get(&extraction_cache_key(&input.doc_id))
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| {
                ToolError::invalid_payload(format!(
                    "document '{}' has no extracted text available",
                    input.doc_id
                ))
            })?;
        if doc.user_id != ctx.user_id {
            return Err(ToolError::unauthorized("document belongs to another user"));
        }

        let started = Instant::now();
        let fragments = Self::fragment(&doc.text);
        let config = json!({
            "policy_id": input.policy_id,
            "enable_disclaimer": input.enable_disclaimer,
            "enable_format": input.enable_format,
            "enable_grammar": input.enable_grammar,
            "enable_logo": input.enable_logo,
        });

        let mut findings: Vec<Finding> = Vec::new();
        let mut summaries: Vec<String> = Vec::new();
        for auditor in &self.auditors {
            if ctx.is_cancelled() {
                return Err(ToolError::new("cancelled", "audit cancelled at checkpoint"));
            }
            let (auditor_findings, summary) = auditor.run(&fragments, &config);
            findings.extend(auditor_findings);
            summaries.push(summary);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            doc_id = %input.doc_id,
            chat_id = ?input.chat_id,
            policy = %input.policy_id,
            findings = findings.len(),
            duration_ms,
            "audit complete"
        );

        Ok(json!({
            "job_id": Uuid::new_v4().to_string(),
            "validation_report_id": Uuid::new_v4().to_string(),
            "policy_used": input.policy_id,
            "total_findings": findings.len(),
            "findings": findings,
            "summary": summaries.join(" | "),
            "duration_ms": duration_ms,
            "status": "completed",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_cache(doc_id: &str, user_id: &str, text: &str) -> Arc<MemoryCache> {
        let cache = Arc::new(MemoryCache::new());
        let doc = ExtractedDocument {
            file_id: doc_id.to_string(),
            filename: format!("{doc_id}.pdf"),
            content_type: "application/pdf".to_string(),
            pages: Some(2),
            text: text.to_string(),
            user_id: user_id.to_string(),
            metadata: json!({}),
        };
        cache.set(
            extraction_cache_key(doc_id),
            serde_json::to_value(doc).expect("serialize"),
            None,
        );
        cache
    }

    #[tokio::test]
    async fn audits_extracted_document() {
        let cache = seeded_cache("doc-1", "u-1", "Primer párrafo.\n\n\n\nTercero.");
        let tool = AuditFileTool::with_default_auditors(cache);
        let result = tool
            .invoke(json!({"doc_id": "doc-1"}), &ToolContext::new("r", "u-1"))
            .await
            .expect("invoke");
        assert_eq!(result["status"], "completed");
        assert_eq!(result["policy_used"], "auto");
        // The double blank line yields an empty fragment finding.
        assert!(result["total_findings"].as_u64().expect("count") >= 1);
    }

    #[tokio::test]
    async fn rejects_foreign_document() {
        let cache = seeded_cache("doc-1", "owner", "texto");
        let tool = AuditFileTool::with_default_auditors(cache);
        let err = tool
            .invoke(json!({"doc_id": "doc-1"}), &ToolContext::new("r", "intruder"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "unauthorized");
    }

    #[tokio::test]
    async fn missing_extraction_is_invalid_payload() {
        let tool = AuditFileTool::with_default_auditors(Arc::new(MemoryCache::new()));
        let err = tool
            .invoke(json!({"doc_id": "ghost"}), &ToolContext::new("r", "u-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_payload");
    }

    #[tokio::test]
    async fn anonymous_caller_rejected() {
        let tool = AuditFileTool::with_default_auditors(Arc::new(MemoryCache::new()));
        let err = tool
            .invoke(json!({"doc_id": "doc-1"}), &ToolContext::new("r", ""))
            .await
            .unwrap_err();
        assert_eq!(err.code, "unauthorized");
    }
}
