use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("Query analysis error: {0}")]
    Analysis(String),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
