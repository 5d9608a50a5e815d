use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use copilotos_core::ApiError;

/// RFC 7807 error envelope with the semantic `code` extension.
#[derive(Debug, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Per-field detail for validation failures.
#[derive(Debug, Serialize)]
pub struct FieldError {
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl Problem {
    pub fn from_error(error: &ApiError, instance: Option<String>) -> Self {
        let status = error.status();
        let retry_after_ms = match error {
            ApiError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        let errors = match error {
            ApiError::MissingField { field } => Some(vec![FieldError {
                loc: vec![field.clone()],
                msg: "campo requerido".to_string(),
                error_type: "missing".to_string(),
            }]),
            ApiError::InvalidFormat(field) => Some(vec![FieldError {
                loc: vec![field.clone()],
                msg: "formato inválido".to_string(),
                error_type: "format".to_string(),
            }]),
            _ => None,
        };
        Self {
            problem_type: "about:blank".to_string(),
            title: title_for(status),
            status,
            detail: error.to_string(),
            code: error.code().to_string(),
            instance,
            errors,
            retry_after_ms,
        }
    }
}

fn title_for(status: u16) -> String {
    match status {
        400 => "Solicitud inválida",
        401 => "No autorizado",
        403 => "Prohibido",
        404 => "No encontrado",
        409 => "Conflicto",
        410 => "No disponible",
        422 => "Entidad no procesable",
        429 => "Demasiadas solicitudes",
        502 => "Error de pasarela",
        504 => "Tiempo de espera agotado",
        _ => "Error interno",
    }
    .to_string()
}

/// Handler error type: wraps the taxonomy and renders the envelope.
#[derive(Debug)]
pub struct ApiProblem(pub ApiError);

impl From<ApiError> for ApiProblem {
    fn from(error: ApiError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiProblem {
    fn into_response(self) -> Response {
        let problem = Problem::from_error(&self.0, None);
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Internal details never leave the process in full.
        if status.is_server_error() {
            tracing::error!(code = problem.code, detail = %problem.detail, "request failed");
        }

        (status, Json(problem)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiProblem>;
