use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use copilotos_core::scrub;

use crate::cache::ToolResultCache;
use crate::metrics;
use crate::registry::ToolRegistry;
use crate::security::{check_scope, required_scope, PayloadValidator, RateLimiter};
use crate::spec::RateLimitConfig;
use crate::tasks::{TaskManager, TaskStatus};
use crate::tool::{ToolContext, ToolError};

/// Body of `POST /api/mcp/invoke`.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeRequest {
    pub tool: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Structured error inside the invoke envelope.
#[derive(Debug, Clone, Serialize)]
pub struct InvokeError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Normalized response envelope. Always HTTP 200 — pipeline failures are
/// carried in `error`, never thrown past the invoker.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvokeResponse {
    pub success: bool,
    pub tool: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InvokeError>,
    pub metadata: Value,
    pub invocation_id: String,
    pub duration_ms: u64,
    pub cached: bool,
}

impl ToolInvokeResponse {
    fn failure(tool: &str, version: &str, error: InvokeError, started: Instant) -> Self {
        Self {
            success: false,
            tool: tool.to_string(),
            version: version.to_string(),
            result: None,
            error: Some(error),
            metadata: Value::Null,
            invocation_id: Uuid::new_v4().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            cached: false,
        }
    }
}

/// Gate pipeline around tool execution.
pub struct McpInvoker {
    registry: Arc<ToolRegistry>,
    rate_limiter: Arc<RateLimiter>,
    result_cache: Arc<ToolResultCache>,
    default_rate_limit: RateLimitConfig,
    max_payload_kb: usize,
}

impl McpInvoker {
    pub fn new(
        registry: Arc<ToolRegistry>,
        rate_limiter: Arc<RateLimiter>,
        result_cache: Arc<ToolResultCache>,
        default_rate_limit: RateLimitConfig,
        max_payload_kb: usize,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            result_cache,
            default_rate_limit,
            max_payload_kb,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the full gate pipeline and execute the tool.
    ///
    /// Order: payload size → payload structure → scope → rate limit →
    /// version resolution → cache probe → execution under timeout →
    /// normalization. Each gate short-circuits into an error envelope.
    pub async fn invoke(&self, req: InvokeRequest, ctx: &ToolContext) -> ToolInvokeResponse {
        let started = Instant::now();
        let tool_name = req.tool.trim().to_string();
        let requested_version = req.version.as_deref().unwrap_or("latest").to_string();
        let user_type = if check_scope(&ctx.scopes, crate::security::scopes::ADMIN_ALL) {
            "admin"
        } else {
            "standard"
        };

        // Gate 1: serialized payload size.
        if let Err(message) = PayloadValidator::validate_size(&req.payload, self.max_payload_kb) {
            metrics::record_invocation(&tool_name, &requested_version, false, "VALIDATION_ERROR", user_type, 0.0);
            return ToolInvokeResponse::failure(
                &tool_name,
                &requested_version,
                InvokeError {
                    code: "VALIDATION_ERROR".to_string(),
                    message,
                    retryable: false,
                    retry_after_ms: None,
                    details: Value::Null,
                },
                started,
            );
        }

        // Gate 2: structural limits.
        if let Err(message) = PayloadValidator::validate_structure(&req.payload) {
            metrics::record_invocation(&tool_name, &requested_version, false, "VALIDATION_ERROR", user_type, 0.0);
            return ToolInvokeResponse::failure(
                &tool_name,
                &requested_version,
                InvokeError {
                    code: "VALIDATION_ERROR".to_string(),
                    message,
                    retryable: false,
                    retry_after_ms: None,
                    details: Value::Null,
                },
                started,
            );
        }

        // Gate 3: scope authorization. Runs before the rate limiter so a
        // denied call leaves no rate-limit state behind.
        if let Some(scope) = required_scope(&tool_name) {
            if !check_scope(&ctx.scopes, scope) {
                metrics::record_invocation(&tool_name, &requested_version, false, "PERMISSION_DENIED", user_type, 0.0);
                return ToolInvokeResponse::failure(
                    &tool_name,
                    &requested_version,
                    InvokeError {
                        code: "PERMISSION_DENIED".to_string(),
                        message: format!("missing required scope '{scope}' for tool '{tool_name}'"),
                        retryable: false,
                        retry_after_ms: None,
                        details: json!({ "required_scope": scope }),
                    },
                    started,
                );
            }
        }

        // Gate 4: sliding-window rate limit per (user, tool).
        let rate_key = format!("{}:{}", ctx.user_id, tool_name);
        if let Err(limited) = self.rate_limiter.check(&rate_key, self.default_rate_limit) {
            metrics::record_invocation(&tool_name, &requested_version, false, "RATE_LIMIT", user_type, 0.0);
            return ToolInvokeResponse::failure(
                &tool_name,
                &requested_version,
                InvokeError {
                    code: "RATE_LIMIT".to_string(),
                    message: "Demasiadas solicitudes, intenta de nuevo más tarde".to_string(),
                    retryable: true,
                    retry_after_ms: Some(limited.retry_after_ms),
                    details: Value::Null,
                },
                started,
            );
        }

        // Gate 5: version resolution.
        let (tool, version) = match self.registry.resolve(&tool_name, req.version.as_deref()) {
            Ok(resolved) => resolved,
            Err(err) => {
                metrics::record_invocation(&tool_name, &requested_version, false, "TOOL_NOT_FOUND", user_type, 0.0);
                return ToolInvokeResponse::failure(
                    &tool_name,
                    &requested_version,
                    InvokeError {
                        code: "TOOL_NOT_FOUND".to_string(),
                        message: err.to_string(),
                        retryable: false,
                        retry_after_ms: None,
                        details: json!({ "available_versions": err.available_versions }),
                    },
                    started,
                );
            }
        };
        let version_str = version.to_string();
        let spec = tool.spec();

        // Cache probe: results are keyed per document; requests without a
        // doc_id are never cached.
        let doc_id = req
            .payload
            .get("doc_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        if let Some(doc) = &doc_id {
            if let Some(cached) = self.result_cache.get(&tool_name, doc, &req.payload) {
                info!(tool = %tool_name, doc_id = %doc, "serving cached tool result");
                metrics::record_invocation(&tool_name, &version_str, true, "OK_CACHED", user_type, started.elapsed().as_millis() as f64);
                return ToolInvokeResponse {
                    success: true,
                    tool: tool_name,
                    version: version_str,
                    result: Some(cached),
                    error: None,
                    metadata: json!({ "capabilities": spec.capabilities, "source": ctx.source }),
                    invocation_id: Uuid::new_v4().to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cached: true,
                };
            }
        }

        // Inject the caller identity when the tool's schema asks for it and
        // the payload left it out.
        let mut payload = req.payload.clone();
        let schema_wants_user = spec
            .input_schema
            .get("properties")
            .and_then(|p| p.get("user_id"))
            .is_some();
        if schema_wants_user && payload.get("user_id").is_none() {
            if let Value::Object(map) = &mut payload {
                map.insert("user_id".to_string(), json!(ctx.user_id));
            }
        }

        // Gate 6: execution under the tool's timeout.
        let timeout = Duration::from_millis(spec.timeout_ms);
        let outcome = tokio::time::timeout(timeout, tool.invoke(payload, ctx)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let response = match outcome {
            Err(_) => {
                warn!(tool = %tool_name, timeout_ms = spec.timeout_ms, "tool timed out");
                ToolInvokeResponse::failure(
                    &tool_name,
                    &version_str,
                    InvokeError {
                        code: "TIMEOUT".to_string(),
                        message: format!("{tool_name} timed out after {}ms", spec.timeout_ms),
                        retryable: true,
                        retry_after_ms: None,
                        details: Value::Null,
                    },
                    started,
                )
            }
            Ok(Err(err)) => {
                let mapped = map_tool_error(&tool_name, err);
                metrics::record_invocation(&tool_name, &version_str, false, &mapped.code, user_type, duration_ms as f64);
                return ToolInvokeResponse::failure(&tool_name, &version_str, mapped, started);
            }
            Ok(Ok(result)) => {
                if let Some(doc) = &doc_id {
                    self.result_cache.set(&tool_name, doc, &req.payload, result.clone());
                }
                ToolInvokeResponse {
                    success: true,
                    tool: tool_name.clone(),
                    version: version_str.clone(),
                    result: Some(result),
                    error: None,
                    metadata: json!({ "capabilities": spec.capabilities, "source": ctx.source }),
                    invocation_id: Uuid::new_v4().to_string(),
                    duration_ms,
                    cached: false,
                }
            }
        };

        let outcome_label = match &response.error {
            Some(err) => err.code.clone(),
            None => "OK".to_string(),
        };
        metrics::record_invocation(
            &tool_name,
            &version_str,
            response.success,
            &outcome_label,
            user_type,
            duration_ms as f64,
        );
        response
    }

    /// Background execution path for long-running tasks.
    ///
    /// Marks the lifecycle on the manager (single writer for this task)
    /// and polls the cancellation flag before, during and after the tool
    /// run. Tools observe mid-flight cancellation via the context flag and
    /// bail with the `cancelled` code.
    pub async fn execute_task(&self, manager: Arc<TaskManager>, task_id: &str, ctx: ToolContext) {
        let Some(task) = manager.get_task(task_id) else {
            warn!(task_id, "task vanished before execution");
            return;
        };

        if manager.is_cancellation_requested(task_id) {
            manager.mark_cancelled(task_id);
            return;
        }

        manager.mark_running(task_id);
        manager.update_progress(task_id, 0.05, Some("running".to_string()));

        // Bridge the manager's cancellation flag into the tool context so
        // the running tool can observe it at its own checkpoints.
        let token = ctx.cancellation_token();
        let watcher = {
            let manager = Arc::clone(&manager);
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(250));
                loop {
                    interval.tick().await;
                    if manager.is_cancellation_requested(&task_id) {
                        token.cancel();
                        break;
                    }
                }
            })
        };

        let response = self
            .invoke(
                InvokeRequest {
                    tool: task.tool.clone(),
                    version: None,
                    payload: task.payload.clone(),
                    idempotency_key: None,
                },
                &ctx,
            )
            .await;
        watcher.abort();

        if response.success {
            manager.mark_completed(task_id, response.result.unwrap_or(Value::Null));
            return;
        }

        let error = response.error.expect("failed response carries error");
        let cancelled = manager.is_cancellation_requested(task_id)
            || error.details.get("exc_type").and_then(|v| v.as_str()) == Some("cancelled");
        if cancelled {
            manager.mark_cancelled(task_id);
        } else {
            manager.mark_failed(
                task_id,
                json!({
                    "code": error.code,
                    "message": error.message,
                    "retryable": error.retryable,
                }),
            );
        }
    }

    /// Invoke a tool for each document with default params, priming the
    /// result cache. Per-document failures are tolerated and reported.
    pub async fn warmup_tool_cache(
        &self,
        tool: &str,
        doc_ids: &[String],
        ctx: &ToolContext,
    ) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(doc_ids.len());
        for doc_id in doc_ids {
            let response = self
                .invoke(
                    InvokeRequest {
                        tool: tool.to_string(),
                        version: None,
                        payload: json!({ "doc_id": doc_id }),
                        idempotency_key: None,
                    },
                    &ctx.clone().with_source("warmup"),
                )
                .await;
            if !response.success {
                warn!(tool, doc_id = %doc_id, "warmup invocation failed");
            }
            results.push((doc_id.clone(), response.success));
        }
        results
    }
}

/// Map a tool-level error into the invoke envelope taxonomy. Messages are
/// PII-scrubbed before leaving the pipeline.
fn map_tool_error(tool: &str, err: ToolError) -> InvokeError {
    let scrubbed = scrub::scrub(&err.message);
    match err.code.as_str() {
        "timeout" => InvokeError {
            code: "TIMEOUT".to_string(),
            message: scrubbed,
            retryable: true,
            retry_after_ms: None,
            details: err.details,
        },
        "invalid_payload" | "validation_error" => InvokeError {
            code: "INVALID_INPUT".to_string(),
            message: scrubbed,
            retryable: false,
            retry_after_ms: None,
            details: err.details,
        },
        "unauthorized" | "permission_denied" => InvokeError {
            code: "PERMISSION_DENIED".to_string(),
            message: scrubbed,
            retryable: false,
            retry_after_ms: None,
            details: err.details,
        },
        other => {
            warn!(tool, code = other, "tool execution error");
            InvokeError {
                code: "EXECUTION_ERROR".to_string(),
                message: scrubbed,
                retryable: err.retryable,
                retry_after_ms: None,
                details: json!({ "exc_type": other }),
            }
        }
    }
}

/// 202 payload for `POST /api/mcp/tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: TaskStatus,
    pub poll_url: String,
    pub cancel_url: String,
    pub estimated_duration_ms: u64,
}

impl TaskAccepted {
    pub fn new(task_id: String, tool: &str, payload: &Value) -> Self {
        Self {
            poll_url: format!("/api/mcp/tasks/{task_id}"),
            cancel_url: format!("/api/mcp/tasks/{task_id}"),
            estimated_duration_ms: TaskManager::estimate_duration_ms(tool, payload),
            status: TaskStatus::Pending,
            task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolResultCache;
    use crate::security::scopes;
    use crate::spec::ToolSpec;
    use crate::tasks::TaskPriority;
    use crate::tool::Tool;
    use async_trait::async_trait;
    use copilotos_core::cache::MemoryCache;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        calls: Arc<AtomicUsize>,
        delay_ms: u64,
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "audit_file".to_string(),
                version: "1.0.0".to_string(),
                display_name: "Audit".to_string(),
                description: "audit".to_string(),
                category: "audit".to_string(),
                capabilities: vec!["documents".to_string()],
                input_schema: json!({
                    "type": "object",
                    "properties": { "doc_id": {"type": "string"}, "user_id": {"type": "string"} }
                }),
                output_schema: json!({}),
                tags: vec![],
                owner: "copilot-os".to_string(),
                rate_limit: None,
                timeout_ms: 200,
                max_payload_kb: 8,
                requires_auth: true,
            }
        }

        async fn invoke(&self, payload: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if ctx.is_cancelled() {
                return Err(ToolError::new("cancelled", "cancelled at checkpoint"));
            }
            if let Some(code) = self.fail_with {
                return Err(ToolError::new(code, "boom with a@b.example inside"));
            }
            Ok(json!({"echo": payload, "user": ctx.user_id}))
        }
    }

    fn invoker_with(tool: CountingTool) -> McpInvoker {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool)).expect("register");
        McpInvoker::new(
            Arc::new(registry),
            Arc::new(RateLimiter::new()),
            Arc::new(ToolResultCache::new(Arc::new(MemoryCache::new()))),
            RateLimitConfig { calls_per_minute: 60, calls_per_hour: 600 },
            1024,
        )
    }

    fn ctx() -> ToolContext {
        ToolContext::new("req-1", "u-1").with_scopes(HashSet::from([
            scopes::TOOLS_ALL.to_string(),
            scopes::TASKS_CREATE.to_string(),
        ]))
    }

    fn request(payload: Value) -> InvokeRequest {
        InvokeRequest {
            tool: "audit_file".to_string(),
            version: None,
            payload,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn oversized_payload_rejected_without_tool_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let invoker = invoker_with(CountingTool { calls: Arc::clone(&calls), delay_ms: 0, fail_with: None });
        // > 1 MB of string payload.
        let big = json!({"blob": "x".repeat(5000), "more": vec!["y".repeat(5000); 250]});
        let response = invoker.invoke(request(big), &ctx()).await;
        assert!(!response.success);
        assert_eq!(response.error.expect("error").code, "VALIDATION_ERROR");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deep_nesting_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let invoker = invoker_with(CountingTool { calls: Arc::clone(&calls), delay_ms: 0, fail_with: None });
        let mut value = json!("leaf");
        for _ in 0..12 {
            value = json!({"n": value});
        }
        let response = invoker.invoke(request(value), &ctx()).await;
        assert_eq!(response.error.expect("error").code, "VALIDATION_ERROR");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_scope_denied_without_rate_limit_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let invoker = invoker_with(CountingTool { calls: Arc::clone(&calls), delay_ms: 0, fail_with: None });
        let no_scope = ToolContext::new("req-1", "u-1");

        let response = invoker.invoke(request(json!({})), &no_scope).await;
        assert_eq!(response.error.expect("error").code, "PERMISSION_DENIED");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The denied call left no rate-limit state: a properly scoped call
        // from the same user is still the first in its window.
        let response = invoker.invoke(request(json!({})), &ctx()).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn rate_limit_envelope_carries_retry_hint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(CountingTool { calls: Arc::clone(&calls), delay_ms: 0, fail_with: None }))
            .expect("register");
        let invoker = McpInvoker::new(
            Arc::new(registry),
            Arc::new(RateLimiter::new()),
            Arc::new(ToolResultCache::new(Arc::new(MemoryCache::new()))),
            RateLimitConfig { calls_per_minute: 2, calls_per_hour: 600 },
            1024,
        );

        assert!(invoker.invoke(request(json!({})), &ctx()).await.success);
        assert!(invoker.invoke(request(json!({})), &ctx()).await.success);
        let response = invoker.invoke(request(json!({})), &ctx()).await;
        assert!(!response.success);
        let error = response.error.expect("error");
        assert_eq!(error.code, "RATE_LIMIT");
        assert!(error.retry_after_ms.expect("retry hint") > 0);
    }

    #[tokio::test]
    async fn unknown_version_lists_available() {
        let invoker = invoker_with(CountingTool { calls: Arc::new(AtomicUsize::new(0)), delay_ms: 0, fail_with: None });
        let response = invoker
            .invoke(
                InvokeRequest {
                    tool: "audit_file".to_string(),
                    version: Some("2.0.0".to_string()),
                    payload: json!({}),
                    idempotency_key: None,
                },
                &ctx(),
            )
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, "TOOL_NOT_FOUND");
        assert_eq!(error.details["available_versions"], json!(["1.0.0"]));
    }

    #[tokio::test]
    async fn timeout_maps_to_retryable_envelope() {
        // Tool sleeps 500 ms against a 200 ms spec timeout.
        let invoker = invoker_with(CountingTool { calls: Arc::new(AtomicUsize::new(0)), delay_ms: 500, fail_with: None });
        let response = invoker.invoke(request(json!({})), &ctx()).await;
        assert!(!response.success);
        let error = response.error.expect("error");
        assert_eq!(error.code, "TIMEOUT");
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn execution_error_scrubbed_with_exc_type() {
        let invoker = invoker_with(CountingTool {
            calls: Arc::new(AtomicUsize::new(0)),
            delay_ms: 0,
            fail_with: Some("storage_gone"),
        });
        let response = invoker.invoke(request(json!({})), &ctx()).await;
        let error = response.error.expect("error");
        assert_eq!(error.code, "EXECUTION_ERROR");
        assert_eq!(error.details["exc_type"], "storage_gone");
        assert!(error.message.contains("[EMAIL_REDACTED]"));
    }

    #[tokio::test]
    async fn doc_results_cached_and_flagged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let invoker = invoker_with(CountingTool { calls: Arc::clone(&calls), delay_ms: 0, fail_with: None });

        let first = invoker.invoke(request(json!({"doc_id": "doc-1"})), &ctx()).await;
        assert!(first.success);
        assert!(!first.cached);

        let second = invoker.invoke(request(json!({"doc_id": "doc-1"})), &ctx()).await;
        assert!(second.success);
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn user_id_injected_from_context() {
        let invoker = invoker_with(CountingTool { calls: Arc::new(AtomicUsize::new(0)), delay_ms: 0, fail_with: None });
        let response = invoker.invoke(request(json!({})), &ctx()).await;
        let result = response.result.expect("result");
        assert_eq!(result["echo"]["user_id"], "u-1");
    }

    #[tokio::test]
    async fn task_cancellation_reaches_the_tool() {
        let invoker = Arc::new(invoker_with(CountingTool {
            calls: Arc::new(AtomicUsize::new(0)),
            delay_ms: 0,
            fail_with: None,
        }));
        let manager = Arc::new(TaskManager::new(24));
        let task_id = manager.create_task("audit_file", json!({}), "u-1", TaskPriority::Normal);

        // Cancel before the executor picks it up.
        assert!(manager.request_cancellation(&task_id));
        invoker.execute_task(Arc::clone(&manager), &task_id, ctx()).await;
        assert_eq!(
            manager.get_task(&task_id).expect("task").status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn task_completes_through_executor() {
        let invoker = Arc::new(invoker_with(CountingTool {
            calls: Arc::new(AtomicUsize::new(0)),
            delay_ms: 0,
            fail_with: None,
        }));
        let manager = Arc::new(TaskManager::new(24));
        let task_id = manager.create_task("audit_file", json!({"doc_id": "d"}), "u-1", TaskPriority::Normal);
        invoker.execute_task(Arc::clone(&manager), &task_id, ctx()).await;
        let task = manager.get_task(&task_id).expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
        assert!(task.result.is_some());
    }
}
