use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// A raw hit from the vector index.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document_id: String,
    pub chunk_id: u32,
    pub text: String,
    pub score: f64,
    pub page: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// External vector index collaborator. Exposes similarity search plus a
/// positional chunk listing used by the overview strategy.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Cosine-similarity search restricted to one session's documents.
    async fn search(
        &self,
        session_id: &str,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f64,
    ) -> Result<Vec<SearchHit>>;

    /// First `limit` chunks of one document, in document order.
    async fn first_chunks(
        &self,
        session_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;
}

/// External embedding model collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding dimensionality, for index sanity checks.
    fn dimensions(&self) -> usize;
}
