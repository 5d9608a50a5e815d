use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use copilotos_core::ApiError;
use copilotos_mcp::security::{check_scope, scopes};
use copilotos_mcp::tasks::{TaskPriority, TaskStatus};
use copilotos_mcp::{InvokeRequest, ToolContext};

use crate::app::AppState;
use crate::middleware::AuthUser;
use crate::problem::{ApiProblem, ApiResult};

fn tool_context(auth: &AuthUser) -> ToolContext {
    ToolContext::new(uuid::Uuid::new_v4().to_string(), auth.user_id.clone())
        .with_scopes(auth.scopes.clone())
}

fn require_scope(auth: &AuthUser, scope: &str) -> Result<(), ApiProblem> {
    if check_scope(&auth.scopes, scope) {
        Ok(())
    } else {
        Err(ApiProblem(ApiError::PermissionDenied {
            reason: format!("se requiere el alcance '{scope}'"),
        }))
    }
}

/// GET /api/mcp/tools — every registered tool at its latest version, with
/// the full version list alongside.
pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let registry = state.invoker.registry();
    let tools: Vec<Value> = registry
        .tool_names()
        .into_iter()
        .filter_map(|name| {
            let (tool, version) = registry.resolve(&name, None).ok()?;
            let spec = tool.spec();
            Some(json!({
                "name": spec.name,
                "version": version.to_string(),
                "available_versions": registry.available_versions(&name),
                "display_name": spec.display_name,
                "description": spec.description,
                "category": spec.category,
                "capabilities": spec.capabilities,
                "tags": spec.tags,
                "requires_auth": spec.requires_auth,
                "input_schema": spec.input_schema,
                "output_schema": spec.output_schema,
                "timeout_ms": spec.timeout_ms,
                "max_payload_size_kb": spec.max_payload_kb,
            }))
        })
        .collect();
    Ok(Json(json!({ "tools": tools })))
}

/// POST /api/mcp/invoke — always 200; pipeline failures live inside the
/// envelope.
pub async fn invoke(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<InvokeRequest>,
) -> Json<Value> {
    let ctx = tool_context(&auth);
    let response = state.invoker.invoke(req, &ctx).await;
    Json(serde_json::to_value(response).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub include_tools: bool,
    #[serde(default)]
    pub include_metrics: bool,
    #[serde(default)]
    pub include_tasks: bool,
}

/// GET /api/mcp/health — capability-filtered status snapshot.
pub async fn mcp_health(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Json<Value>> {
    let mut body = json!({ "status": "ok" });
    if query.include_tools {
        body["tools"] = json!(state.invoker.registry().tool_names());
    }
    if query.include_tasks {
        let tasks = state.tasks.list_tasks(Some(&auth.user_id), None, None);
        body["tasks"] = json!({
            "total": tasks.len(),
            "running": tasks.iter().filter(|t| t.status == TaskStatus::Running).count(),
        });
    }
    if query.include_metrics {
        require_scope(&auth, scopes::ADMIN_METRICS)?;
        body["metrics"] = json!({ "cache": state.tool_cache.stats(None) });
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub include_schema: bool,
    #[serde(default)]
    pub include_versions: bool,
}

/// GET /api/mcp/discover — filtered discovery over the eager registry.
pub async fn discover(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult<Json<Value>> {
    let registry = state.invoker.registry();
    let tools: Vec<Value> = registry
        .list_specs()
        .into_iter()
        .filter(|spec| query.category.as_deref().is_none_or(|c| spec.category == c))
        .filter(|spec| {
            query
                .capability
                .as_deref()
                .is_none_or(|c| spec.capabilities.iter().any(|have| have == c))
        })
        .filter(|spec| query.tag.as_deref().is_none_or(|t| spec.tags.iter().any(|have| have == t)))
        .filter(|spec| {
            query.search.as_deref().is_none_or(|s| {
                let needle = s.to_lowercase();
                spec.name.to_lowercase().contains(&needle)
                    || spec.description.to_lowercase().contains(&needle)
            })
        })
        .map(|spec| {
            let mut entry = json!({
                "name": spec.name,
                "version": spec.version,
                "display_name": spec.display_name,
                "description": spec.description,
                "category": spec.category,
                "capabilities": spec.capabilities,
                "tags": spec.tags,
            });
            if query.include_schema {
                entry["input_schema"] = spec.input_schema.clone();
                entry["output_schema"] = spec.output_schema.clone();
            }
            if query.include_versions {
                entry["available_versions"] = json!(registry.available_versions(&spec.name));
            }
            entry
        })
        .collect();
    Ok(Json(json!({ "tools": tools })))
}

#[derive(Debug, Deserialize)]
pub struct SchemaQuery {
    #[serde(default)]
    pub version: Option<String>,
}

/// GET /api/mcp/schema/{tool} — schemas plus a generated example payload.
pub async fn schema(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    Path(tool): Path<String>,
    Query(query): Query<SchemaQuery>,
) -> ApiResult<Json<Value>> {
    let (tool, version) = state
        .invoker
        .registry()
        .resolve(&tool, query.version.as_deref())
        .map_err(|e| {
            ApiProblem(ApiError::ToolNotFound {
                name: e.tool.clone(),
            })
        })?;
    let spec = tool.spec();
    Ok(Json(json!({
        "name": spec.name,
        "version": version.to_string(),
        "input_schema": spec.input_schema,
        "output_schema": spec.output_schema,
        "example_payload": spec.example_payload(),
    })))
}

// ── tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub tool: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

/// POST /api/mcp/tasks — 202 with poll/cancel URLs and a duration estimate.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_scope(&auth, scopes::TASKS_CREATE)?;

    let task_id = state.tasks.create_task(
        &req.tool,
        req.payload.clone(),
        &auth.user_id,
        req.priority.unwrap_or_default(),
    );
    let accepted =
        copilotos_mcp::invoke::TaskAccepted::new(task_id.clone(), &req.tool, &req.payload);

    // Background executor owns the task lifecycle from here.
    let invoker = Arc::clone(&state.invoker);
    let manager = Arc::clone(&state.tasks);
    let ctx = tool_context(&auth).with_source("task");
    tokio::spawn(async move {
        invoker.execute_task(manager, &task_id, ctx).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::to_value(accepted).unwrap_or_default()),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

/// GET /api/mcp/tasks — the caller's tasks, filtered.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::TASKS_READ)?;
    let status = query.status.as_deref().and_then(|raw| {
        serde_json::from_value::<TaskStatus>(json!(raw)).ok()
    });
    let tasks: Vec<Value> = state
        .tasks
        .list_tasks(Some(&auth.user_id), query.tool.as_deref(), status)
        .into_iter()
        .map(|t| serde_json::to_value(&t).unwrap_or_default())
        .collect();
    Ok(Json(json!({ "tasks": tasks })))
}

/// GET /api/mcp/tasks/{id} — owner-only snapshot with progress.
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::TASKS_READ)?;
    let task = state
        .tasks
        .get_task(&id)
        .ok_or_else(|| ApiProblem(ApiError::NotFound(format!("tarea {id}"))))?;
    if task.user_id != auth.user_id {
        return Err(ApiProblem(ApiError::PermissionDenied {
            reason: "la tarea pertenece a otro usuario".to_string(),
        }));
    }
    Ok(Json(serde_json::to_value(&task).unwrap_or_default()))
}

/// DELETE /api/mcp/tasks/{id} — request cooperative cancellation. 202 in
/// every case; repeating the call on a terminal task reports its status.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_scope(&auth, scopes::TASKS_CANCEL)?;
    let task = state
        .tasks
        .get_task(&id)
        .ok_or_else(|| ApiProblem(ApiError::NotFound(format!("tarea {id}"))))?;
    if task.user_id != auth.user_id {
        return Err(ApiProblem(ApiError::PermissionDenied {
            reason: "la tarea pertenece a otro usuario".to_string(),
        }));
    }

    let requested = state.tasks.request_cancellation(&id);
    let task = state.tasks.get_task(&id).expect("task still present");
    info!(task_id = %id, requested, status = task.status.as_str(), "task cancellation");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": id,
            "cancellation_requested": requested || task.status == TaskStatus::Cancelled,
            "status": task.status,
        })),
    ))
}

// ── cache admin ─────────────────────────────────────────────────────────

/// DELETE /api/mcp/cache/tool/{tool}/{doc}
pub async fn invalidate_tool_cache(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path((tool, doc)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::ADMIN_TOOLS_MANAGE)?;
    let removed = state
        .tool_cache
        .invalidate_tool_cache(&tool, &doc, &json!({ "doc_id": doc.clone() }));
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
pub struct DocumentCacheQuery {
    #[serde(default)]
    pub tool: Option<String>,
}

/// DELETE /api/mcp/cache/document/{doc}?tool
pub async fn invalidate_document_cache(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(doc): Path<String>,
    Query(query): Query<DocumentCacheQuery>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::ADMIN_TOOLS_MANAGE)?;
    let removed = state
        .tool_cache
        .invalidate_document_tool_cache(&doc, query.tool.as_deref());
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
pub struct AllCachesQuery {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

/// DELETE /api/mcp/cache/all?tool&confirm=true — destructive, requires
/// the explicit confirmation flag.
pub async fn invalidate_all_caches(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<AllCachesQuery>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::ADMIN_TOOLS_MANAGE)?;
    if !query.confirm {
        return Err(ApiProblem(ApiError::InvalidInput(
            "agrega confirm=true para vaciar la caché completa".to_string(),
        )));
    }
    let removed = state.tool_cache.invalidate_all_tool_caches(query.tool.as_deref());
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
pub struct CacheStatsQuery {
    #[serde(default)]
    pub doc_id: Option<String>,
}

/// GET /api/mcp/cache/stats?doc_id
pub async fn cache_stats(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    Query(query): Query<CacheStatsQuery>,
) -> ApiResult<Json<Value>> {
    let stats = state.tool_cache.stats(query.doc_id.as_deref());
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct WarmupQuery {
    pub tool: String,
    /// CSV of document ids.
    pub doc_ids: String,
}

/// POST /api/mcp/cache/warmup?tool&doc_ids=a,b — per-doc failures are
/// tolerated and reported.
pub async fn warmup_cache(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<WarmupQuery>,
) -> ApiResult<Json<Value>> {
    let doc_ids: Vec<String> = query
        .doc_ids
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if doc_ids.is_empty() {
        return Err(ApiProblem(ApiError::MissingField {
            field: "doc_ids".to_string(),
        }));
    }

    let ctx = tool_context(&auth);
    let results = state
        .invoker
        .warmup_tool_cache(&query.tool, &doc_ids, &ctx)
        .await;
    let warmed: Vec<Value> = results
        .into_iter()
        .map(|(doc, ok)| json!({ "doc_id": doc, "warmed": ok }))
        .collect();
    Ok(Json(json!({ "tool": query.tool, "results": warmed })))
}

// ── lazy variants ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LazyDiscoverQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
}

/// GET /api/mcp/lazy/discover — metadata only, nothing constructed.
pub async fn lazy_discover(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    Query(query): Query<LazyDiscoverQuery>,
) -> ApiResult<Json<Value>> {
    let tools = state
        .lazy
        .discover(query.category.as_deref(), query.search.as_deref());
    Ok(Json(json!({ "tools": tools })))
}

/// GET /api/mcp/lazy/tools/{name} — forces the load, returns the spec.
pub async fn lazy_tool_spec(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let spec = state
        .lazy
        .get_tool_spec(&name)
        .ok_or_else(|| ApiProblem(ApiError::ToolNotFound { name }))?;
    Ok(Json(serde_json::to_value(spec).unwrap_or_default()))
}

/// POST /api/mcp/lazy/invoke — forces the load, then dispatches through
/// the shared gate pipeline.
pub async fn lazy_invoke(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<Json<Value>> {
    if state.lazy.get(&req.tool).is_none() {
        return Err(ApiProblem(ApiError::ToolNotFound {
            name: req.tool.clone(),
        }));
    }
    let ctx = tool_context(&auth);
    let response = state.invoker.invoke(req, &ctx).await;
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

/// GET /api/mcp/lazy/stats — admin-scoped registry statistics.
pub async fn lazy_stats(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::ADMIN_ALL)?;
    Ok(Json(serde_json::to_value(state.lazy.stats()).unwrap_or_default()))
}

/// POST /api/mcp/lazy/tools/{name}/unload — admin-scoped instance release.
pub async fn lazy_unload(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    require_scope(&auth, scopes::ADMIN_ALL)?;
    let unloaded = state.lazy.unload_tool(&name);
    Ok(Json(json!({ "tool": name, "unloaded": unloaded })))
}
