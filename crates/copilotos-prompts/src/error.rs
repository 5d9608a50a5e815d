use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Invalid prompt registry: {0}")]
    InvalidConfig(String),

    #[error("Model '{model}' not found and no default model available")]
    ModelNotConfigured { model: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PromptError>;
