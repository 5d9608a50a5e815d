use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use copilotos_core::ApiError;

use crate::app::AppState;
use crate::middleware::AuthUser;
use crate::problem::{ApiProblem, ApiResult};

/// GET /health — liveness, no auth.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mock_upstream": state.chat.client().is_mock(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct IntentRequest {
    pub text: String,
}

/// POST /api/intent — heuristic message classification.
pub async fn classify_intent(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    Json(req): Json<IntentRequest>,
) -> ApiResult<Json<Value>> {
    if req.text.trim().is_empty() {
        return Err(ApiProblem(ApiError::MissingField {
            field: "text".to_string(),
        }));
    }
    let prediction = state.intent.classify(&req.text);
    Ok(Json(json!({
        "intent": prediction.intent.as_str(),
        "confidence": prediction.confidence,
        "reasons": prediction.reasons,
        "model": prediction.model,
    })))
}

/// GET /api/models — models configured in the prompt registry.
pub async fn models(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
) -> Json<Value> {
    Json(json!({
        "models": state.prompts.available_models(),
        "prompt_version": state.prompts.version,
    }))
}

/// GET /api/features — feature flags visible to clients.
pub async fn features(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
) -> Json<Value> {
    Json(json!({
        "deep_research": !state.config.research.kill_switch,
        "model_system_prompt": state.config.prompts.enable_model_system_prompt,
        "mock_upstream": state.chat.client().is_mock(),
    }))
}

/// GET /api/metrics — Prometheus exposition.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
) -> String {
    state.metrics_handle.render()
}

/// GET /api/settings — the caller's preference blob.
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let user = state
        .auth
        .get_user(&auth.user_id)?
        .ok_or_else(|| ApiProblem(ApiError::InvalidToken))?;
    Ok(Json(json!({ "preferences": user.preferences })))
}

/// PATCH /api/settings — shallow-merge a preferences patch.
pub async fn patch_settings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    let merged = state.auth.update_preferences(&auth.user_id, patch)?;
    Ok(Json(json!({ "preferences": merged })))
}

#[derive(Debug, Deserialize)]
pub struct ResearchQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// GET /api/research — 410 while the kill switch is active.
pub async fn research_list(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ResearchQuery>,
) -> ApiResult<Json<Value>> {
    research_guard(&state)?;
    let status = query
        .status
        .as_deref()
        .and_then(|raw| serde_json::from_value(json!(raw)).ok());
    let tasks: Vec<Value> = state
        .tasks
        .list_tasks(Some(&auth.user_id), Some("deep_research"), status)
        .into_iter()
        .map(|t| serde_json::to_value(&t).unwrap_or_default())
        .collect();
    Ok(Json(json!({ "tasks": tasks })))
}

/// POST /api/research — 410 while the kill switch is active.
pub async fn research_trigger(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    research_guard(&state)?;
    // The research pipeline is feature-gated off by default; reaching this
    // point means the switch was explicitly disabled without a research
    // backend configured.
    Err(ApiProblem(ApiError::NotFound(
        "no hay un backend de investigación configurado".to_string(),
    )))
}

fn research_guard(state: &AppState) -> Result<(), ApiProblem> {
    if state.config.research.kill_switch {
        return Err(ApiProblem(ApiError::Gone));
    }
    Ok(())
}
