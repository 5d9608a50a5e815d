use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use copilotos_core::ApiError;
use copilotos_sessions::{DateRange, ExportFormat, SessionPatch};

use crate::app::AppState;
use crate::middleware::AuthUser;
use crate::problem::{ApiProblem, ApiResult};

fn map_session_error(err: copilotos_sessions::SessionError) -> ApiProblem {
    use copilotos_sessions::SessionError;
    ApiProblem(match err {
        SessionError::NotFound { id } => ApiError::NotFound(format!("sesión {id}")),
        SessionError::PermissionDenied { .. } => ApiError::PermissionDenied {
            reason: "la sesión pertenece a otro usuario".to_string(),
        },
        SessionError::InvalidInput(msg) => ApiError::InvalidInput(msg),
        SessionError::Database(e) => ApiError::Database(e.to_string()),
        SessionError::Serialization(e) => ApiError::Serialization(e),
    })
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Value>> {
    let date_range = (query.date_from.is_some() || query.date_to.is_some()).then(|| DateRange {
        from: query.date_from.clone(),
        to: query.date_to.clone(),
    });
    let page = state
        .sessions
        .get_sessions(
            &auth.user_id,
            query.limit.min(100),
            query.offset,
            query.search.as_deref(),
            date_range.as_ref(),
        )
        .map_err(map_session_error)?;
    Ok(Json(json!({
        "sessions": page.sessions,
        "total_count": page.total_count,
        "has_more": page.has_more,
    })))
}

/// PATCH /api/sessions/{id} — rename or pin.
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Json<Value>> {
    let session = state
        .sessions
        .update_session(&id, &auth.user_id, &patch)
        .map_err(map_session_error)?;
    Ok(Json(json!({ "session": session })))
}

/// DELETE /api/sessions/{id} — cascade delete + history cache invalidation.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .sessions
        .delete_session(&id, &auth.user_id)
        .map_err(map_session_error)?;
    Ok(Json(json!({ "detail": "Sesión eliminada" })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub include_system: bool,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_true")]
    pub include_research_tasks: bool,
}

fn default_history_limit() -> usize {
    50
}
fn default_true() -> bool {
    true
}

/// GET /api/history/{chat_id} — newest-first messages, enriched with the
/// linked research-task snapshot when a message carries a task id.
pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let messages = state
        .sessions
        .get_messages(
            &chat_id,
            &auth.user_id,
            query.limit.min(200),
            query.offset,
            query.include_system,
            query.role.as_deref(),
        )
        .map_err(map_session_error)?;

    let enriched: Vec<Value> = messages
        .into_iter()
        .map(|message| {
            let mut value = serde_json::to_value(&message).unwrap_or_default();
            if query.include_research_tasks {
                if let Some(task_id) = &message.task_id {
                    if let Some(task) = state.tasks.get_task(task_id) {
                        value["research_task"] = json!({
                            "task_id": task.task_id,
                            "status": task.status,
                            "progress": task.progress,
                            "progress_message": task.progress_message,
                        });
                    }
                }
            }
            value
        })
        .collect();

    Ok(Json(json!({
        "chat_id": chat_id,
        "messages": enriched,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

/// GET /api/sessions/{id}/canvas
pub async fn get_canvas(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let canvas = state
        .sessions
        .get_canvas_state(&id, &auth.user_id)
        .map_err(map_session_error)?;
    Ok(Json(json!({ "canvas_state": canvas })))
}

/// PATCH /api/sessions/{id}/canvas — shallow-merge an opaque blob.
pub async fn patch_canvas(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    let merged = state
        .sessions
        .patch_canvas_state(&id, &auth.user_id, patch)
        .map_err(map_session_error)?;
    Ok(Json(json!({ "canvas_state": merged })))
}

#[derive(Debug, Deserialize)]
pub struct SessionResearchQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub status: Option<String>,
}

/// GET /api/sessions/{id}/research — research tasks linked to a session.
pub async fn session_research(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(query): Query<SessionResearchQuery>,
) -> ApiResult<Json<Value>> {
    // Ownership check rides on the session lookup.
    let session = state
        .sessions
        .get_session(&id)
        .map_err(map_session_error)?
        .ok_or_else(|| ApiProblem(ApiError::NotFound(format!("sesión {id}"))))?;
    if session.user_id != auth.user_id {
        return Err(ApiProblem(ApiError::PermissionDenied {
            reason: "la sesión pertenece a otro usuario".to_string(),
        }));
    }

    let status = query.status.as_deref().and_then(parse_status);
    let tasks: Vec<Value> = state
        .tasks
        .list_tasks(Some(&auth.user_id), None, status)
        .into_iter()
        .filter(|task| task.payload.get("chat_id").and_then(|v| v.as_str()) == Some(id.as_str()))
        .skip(query.offset)
        .take(query.limit.min(100))
        .map(|task| serde_json::to_value(&task).unwrap_or_default())
        .collect();

    Ok(Json(json!({ "session_id": id, "tasks": tasks })))
}

fn parse_status(raw: &str) -> Option<copilotos_mcp::tasks::TaskStatus> {
    use copilotos_mcp::tasks::TaskStatus;
    match raw {
        "pending" => Some(TaskStatus::Pending),
        "running" => Some(TaskStatus::Running),
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        "cancelled" => Some(TaskStatus::Cancelled),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub include_metadata: bool,
}

fn default_format() -> String {
    "json".to_string()
}

/// GET /api/sessions/{id}/export
pub async fn export(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<axum::response::Response> {
    use axum::response::IntoResponse;

    let format: ExportFormat = query.format.parse().map_err(map_session_error)?;
    let body = state
        .sessions
        .export(&id, &auth.user_id, format, query.include_metadata)
        .map_err(map_session_error)?;

    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
        ExportFormat::Txt => "text/plain; charset=utf-8",
    };
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], body).into_response())
}
