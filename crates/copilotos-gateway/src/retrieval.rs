//! Default retrieval collaborators.
//!
//! The embedding model and vector index are injected capabilities; these
//! in-process stand-ins keep retrieval working on a single node without
//! an external model server. Swap them for real backends by changing the
//! wiring in `AppState::build`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use dashmap::DashMap;

use copilotos_retrieval::index::{Embedder, SearchHit, VectorIndex};
use copilotos_retrieval::Result;

pub const EMBEDDING_DIMS: usize = 256;
const CHUNK_TARGET_CHARS: usize = 800;

/// Deterministic feature-hashing embedder: words hash into a fixed-size
/// bucket vector, L2-normalized. Crude but stable, and enough to rank
/// lexically related chunks.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; EMBEDDING_DIMS];
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if word.len() < 2 {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % EMBEDDING_DIMS;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMS
    }
}

#[derive(Clone)]
struct StoredChunk {
    document_id: String,
    chunk_id: u32,
    text: String,
    vector: Vec<f32>,
    page: u32,
}

/// Session-partitioned in-memory vector index.
#[derive(Default)]
pub struct MemoryVectorIndex {
    sessions: DashMap<String, Vec<StoredChunk>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the chunks of one document within a session.
    pub fn upsert_document(
        &self,
        session_id: &str,
        document_id: &str,
        chunks: Vec<(u32, String, Vec<f32>, u32)>,
    ) {
        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        entry.retain(|c| c.document_id != document_id);
        entry.extend(
            chunks
                .into_iter()
                .map(|(chunk_id, text, vector, page)| StoredChunk {
                    document_id: document_id.to_string(),
                    chunk_id,
                    text,
                    vector,
                    page,
                }),
        );
    }

    /// Document ids currently indexed for a session.
    pub fn documents(&self, session_id: &str) -> Vec<String> {
        let Some(chunks) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = chunks.iter().map(|c| c.document_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    // Vectors are normalized at encode time, so the dot product suffices.
    a.iter().zip(b).map(|(x, y)| (x * y) as f64).sum()
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn search(
        &self,
        session_id: &str,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f64,
    ) -> Result<Vec<SearchHit>> {
        let Some(chunks) = self.sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<SearchHit> = chunks
            .iter()
            .map(|chunk| SearchHit {
                document_id: chunk.document_id.clone(),
                chunk_id: chunk.chunk_id,
                text: chunk.text.clone(),
                score: cosine(&chunk.vector, query_vector).clamp(0.0, 1.0),
                page: chunk.page,
                metadata: HashMap::new(),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn first_chunks(
        &self,
        session_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(chunks) = self.sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut doc_chunks: Vec<&StoredChunk> = chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .collect();
        doc_chunks.sort_by_key(|c| c.chunk_id);
        Ok(doc_chunks
            .into_iter()
            .take(limit)
            .map(|chunk| SearchHit {
                document_id: chunk.document_id.clone(),
                chunk_id: chunk.chunk_id,
                text: chunk.text.clone(),
                score: 0.0,
                page: chunk.page,
                metadata: HashMap::new(),
            })
            .collect())
    }
}

/// Split extracted text into paragraph-aligned chunks of roughly
/// `CHUNK_TARGET_CHARS` characters.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() > CHUNK_TARGET_CHARS {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
        // Oversized single paragraphs are flushed as-is.
        while current.len() > CHUNK_TARGET_CHARS * 2 {
            let mut split_at = CHUNK_TARGET_CHARS;
            while !current.is_char_boundary(split_at) {
                split_at += 1;
            }
            let rest = current.split_off(split_at);
            chunks.push(std::mem::replace(&mut current, rest));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder;
        let a = embedder.encode("el monto del contrato").await.expect("encode");
        let b = embedder.encode("el monto del contrato").await.expect("encode");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn related_text_scores_higher() {
        let embedder = HashEmbedder;
        let index = MemoryVectorIndex::new();
        let contract = embedder
            .encode("el contrato establece un monto total de pago")
            .await
            .expect("encode");
        let weather = embedder
            .encode("mañana lloverá en la ciudad durante la tarde")
            .await
            .expect("encode");
        index.upsert_document(
            "s-1",
            "doc-1",
            vec![
                (0, "contrato y monto".to_string(), contract, 1),
                (1, "clima de mañana".to_string(), weather, 2),
            ],
        );

        let query = embedder
            .encode("cuál es el monto del contrato")
            .await
            .expect("encode");
        let hits = index.search("s-1", &query, 2, 0.0).await.expect("search");
        assert_eq!(hits[0].chunk_id, 0);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn first_chunks_in_document_order() {
        let index = MemoryVectorIndex::new();
        index.upsert_document(
            "s-1",
            "doc-1",
            vec![
                (2, "tercero".to_string(), vec![0.0; EMBEDDING_DIMS], 1),
                (0, "primero".to_string(), vec![0.0; EMBEDDING_DIMS], 1),
                (1, "segundo".to_string(), vec![0.0; EMBEDDING_DIMS], 1),
            ],
        );
        let hits = index.first_chunks("s-1", "doc-1", 2).await.expect("chunks");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "primero");
        assert_eq!(hits[1].text, "segundo");
    }

    #[test]
    fn chunking_respects_paragraphs() {
        let text = format!("{}\n\n{}", "a".repeat(600), "b".repeat(600));
        let chunks = chunk_text(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }
}
