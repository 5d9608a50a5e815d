use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use copilotos_core::ApiError;

use crate::app::AppState;
use crate::middleware::AuthUser;
use crate::problem::{ApiProblem, ApiResult};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

/// POST /api/auth/register — 201 with the user and a token pair.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let user = state.auth.register(&req.username, &req.email, &req.password)?;
    let (_, tokens) = state.auth.login(&req.username, &req.password)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "user": user.public(), "tokens": tokens })),
    ))
}

/// POST /api/auth/login — token pair on success, 401 envelope otherwise.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let (user, tokens) = state.auth.login(&req.identifier, &req.password)?;
    Ok(Json(json!({ "user": user.public(), "tokens": tokens })))
}

/// POST /api/auth/refresh — new pair for a valid, unblacklisted refresh token.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<Value>> {
    let tokens = state.auth.refresh(&req.refresh_token)?;
    Ok(Json(json!({ "tokens": tokens })))
}

/// GET /api/auth/me — profile of the authenticated user.
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let user = state
        .auth
        .get_user(&auth.user_id)?
        .ok_or(ApiError::InvalidToken)
        .map_err(ApiProblem)?;
    Ok(Json(user.public()))
}

/// POST /api/auth/logout — blacklist the bearer token and, when provided,
/// the refresh token.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthUser>,
    headers: axum::http::HeaderMap,
    Json(req): Json<LogoutRequest>,
) -> ApiResult<Json<Value>> {
    let access = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    state.auth.logout(access, req.refresh_token.as_deref())?;
    info!("session closed");
    Ok(Json(json!({ "detail": "Sesión cerrada" })))
}

/// POST /api/auth/forgot-password — always 200, never reveals whether the
/// email exists. The reset token travels by email; the email service is
/// an external capability, so here it only reaches the logs.
pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForgotPasswordRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(_token) = state.auth.forgot_password(&req.email)? {
        info!("password reset token issued");
    }
    Ok(Json(json!({
        "detail": "Si la cuenta existe, enviamos un correo con instrucciones"
    })))
}

/// POST /api/auth/reset-password — 400 on an invalid or expired token.
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<Json<Value>> {
    state
        .auth
        .reset_password(&req.token, &req.new_password)
        .map_err(|e| match e {
            ApiError::InvalidToken => {
                ApiProblem(ApiError::InvalidInput("token inválido o expirado".to_string()))
            }
            other => ApiProblem(other),
        })?;
    Ok(Json(json!({ "detail": "Contraseña actualizada" })))
}
