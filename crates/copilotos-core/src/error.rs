use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing field: {field}")]
    MissingField { field: String },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Credenciales inválidas")]
    InvalidCredentials,

    #[error("La cuenta está desactivada")]
    AccountInactive,

    #[error("Token inválido o expirado")]
    InvalidToken,

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Recurso no encontrado: {0}")]
    NotFound(String),

    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("User not found: {id}")]
    UserNotFound { id: String },

    #[error("El nombre de usuario ya está registrado")]
    UsernameExists,

    #[error("El correo ya está registrado")]
    DuplicateEmail,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Saptiva API timed out after {secs}s")]
    UpstreamTimeout { secs: u64 },

    #[error("Esta función no está disponible")]
    Gone,

    #[error("Upstream execution error: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable semantic code carried in every error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Config(_) => "CONFIG_ERROR",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::MissingField { .. } => "MISSING_FIELD",
            ApiError::InvalidFormat(_) => "INVALID_FORMAT",
            ApiError::InvalidCredentials => "INVALID_CREDENTIALS",
            ApiError::AccountInactive => "ACCOUNT_INACTIVE",
            ApiError::InvalidToken => "INVALID_TOKEN",
            ApiError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            ApiError::UserNotFound { .. } => "USER_NOT_FOUND",
            ApiError::UsernameExists => "USERNAME_EXISTS",
            ApiError::DuplicateEmail => "DUPLICATE_EMAIL",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::RateLimited { .. } => "RATE_LIMIT",
            ApiError::UpstreamTimeout { .. } => "TIMEOUT",
            ApiError::Gone => "GONE",
            ApiError::Execution(_) => "EXECUTION_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Serialization(_) => "SERIALIZATION_ERROR",
            ApiError::Io(_) => "IO_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the gateway maps this error to.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_)
            | ApiError::MissingField { .. }
            | ApiError::InvalidFormat(_) => 422,
            ApiError::InvalidInput(_) => 400,
            ApiError::InvalidCredentials | ApiError::InvalidToken => 401,
            ApiError::AccountInactive | ApiError::PermissionDenied { .. } => 403,
            ApiError::NotFound(_)
            | ApiError::ToolNotFound { .. }
            | ApiError::UserNotFound { .. } => 404,
            ApiError::UsernameExists | ApiError::DuplicateEmail | ApiError::Conflict(_) => 409,
            ApiError::Gone => 410,
            ApiError::RateLimited { .. } => 429,
            ApiError::Execution(_) => 502,
            ApiError::UpstreamTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Whether the caller may retry the same request (carried as a hint).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::UpstreamTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
