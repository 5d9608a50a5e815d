use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::types::{DocumentRef, Segment};

/// Per-run knobs a strategy may honor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyOptions {
    /// Forces the similarity threshold regardless of adaptation.
    pub threshold_override: Option<f64>,
}

/// A pluggable retrieval strategy.
#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    /// Class name reported in `RetrievalResult::strategy_used`.
    fn name(&self) -> &'static str;

    async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        documents: &[DocumentRef],
        max_segments: usize,
        options: StrategyOptions,
    ) -> Result<Vec<Segment>>;
}

/// Returns the first N chunks of each document, unranked.
///
/// The right answer for "what is this document about" — semantic search
/// against a vague query only surfaces noise.
pub struct OverviewStrategy {
    index: Arc<dyn VectorIndex>,
    chunks_per_doc: usize,
}

impl OverviewStrategy {
    pub fn new(index: Arc<dyn VectorIndex>, chunks_per_doc: usize) -> Self {
        Self {
            index,
            chunks_per_doc,
        }
    }
}

#[async_trait]
impl RetrievalStrategy for OverviewStrategy {
    fn name(&self) -> &'static str {
        "OverviewStrategy"
    }

    async fn retrieve(
        &self,
        _query: &str,
        session_id: &str,
        documents: &[DocumentRef],
        max_segments: usize,
        _options: StrategyOptions,
    ) -> Result<Vec<Segment>> {
        let mut segments: Vec<Segment> = Vec::new();

        for doc in documents {
            if segments.len() >= max_segments {
                break;
            }
            let budget = (max_segments - segments.len()).min(self.chunks_per_doc);
            let hits = match self.index.first_chunks(session_id, &doc.id, budget).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(doc_id = %doc.id, error = %e, "overview chunk fetch failed, skipping document");
                    continue;
                }
            };
            for hit in hits {
                segments.push(Segment {
                    doc_id: doc.id.clone(),
                    doc_name: doc.filename.clone(),
                    chunk_id: hit.chunk_id,
                    text: hit.text,
                    // Overview results are unranked.
                    score: 1.0,
                    page: hit.page,
                    metadata: hit.metadata,
                });
            }
        }

        info!(
            segments = segments.len(),
            chunks_per_doc = self.chunks_per_doc,
            "overview retrieval complete"
        );
        Ok(segments)
    }
}

/// Vector similarity search with an adaptive score threshold.
pub struct SemanticSearchStrategy {
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    base_threshold: f64,
}

impl SemanticSearchStrategy {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
        base_threshold: f64,
    ) -> Self {
        Self {
            index,
            embeddings,
            base_threshold,
        }
    }

    /// Short queries loosen the threshold, long queries and large corpora
    /// tighten it slightly. Clamped to [0, 0.8].
    fn adaptive_threshold(
        &self,
        query: &str,
        documents: &[DocumentRef],
        override_value: Option<f64>,
    ) -> f64 {
        if let Some(t) = override_value {
            return t.clamp(0.0, 1.0);
        }

        let mut threshold = self.base_threshold;
        let word_count = query.split_whitespace().count();
        if word_count < 5 {
            threshold -= 0.15;
        } else if word_count > 15 {
            threshold += 0.05;
        }
        if documents.len() > 5 {
            threshold += 0.05;
        }
        let final_threshold = threshold.clamp(0.0, 0.8);

        debug!(
            base = self.base_threshold,
            final_threshold,
            word_count,
            corpus_size = documents.len(),
            "adaptive threshold calculated"
        );
        final_threshold
    }
}

#[async_trait]
impl RetrievalStrategy for SemanticSearchStrategy {
    fn name(&self) -> &'static str {
        "SemanticSearchStrategy"
    }

    async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        documents: &[DocumentRef],
        max_segments: usize,
        options: StrategyOptions,
    ) -> Result<Vec<Segment>> {
        let threshold = self.adaptive_threshold(query, documents, options.threshold_override);
        let query_vector = self.embeddings.encode(query).await?;

        // Over-fetch for headroom; top-k after conversion.
        let hits = match self
            .index
            .search(session_id, &query_vector, max_segments * 2, threshold)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(session_id, error = %e, "semantic search failed, returning empty");
                return Ok(Vec::new());
            }
        };

        let by_id: HashMap<&str, &DocumentRef> =
            documents.iter().map(|d| (d.id.as_str(), d)).collect();

        let segments: Vec<Segment> = hits
            .into_iter()
            .take(max_segments)
            .map(|hit| {
                let doc_name = by_id
                    .get(hit.document_id.as_str())
                    .map(|d| d.filename.clone())
                    .or_else(|| {
                        hit.metadata
                            .get("filename")
                            .and_then(|v| v.as_str().map(String::from))
                    })
                    .unwrap_or_else(|| "Unknown".to_string());
                Segment {
                    doc_id: hit.document_id,
                    doc_name,
                    chunk_id: hit.chunk_id,
                    text: hit.text,
                    score: hit.score,
                    page: hit.page,
                    metadata: hit.metadata,
                }
            })
            .collect();

        info!(
            segments = segments.len(),
            threshold,
            max_score = segments.iter().map(|s| s.score).fold(0.0, f64::max),
            "semantic search complete"
        );
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Embedder, SearchHit};

    struct StaticEmbedder;

    #[async_trait]
    impl Embedder for StaticEmbedder {
        async fn encode(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1, 0.2])
        }
        fn dimensions(&self) -> usize {
            2
        }
    }

    /// Index with three chunks per known document and canned scores.
    struct FakeIndex {
        docs: Vec<String>,
    }

    #[async_trait]
    impl VectorIndex for FakeIndex {
        async fn search(
            &self,
            _session_id: &str,
            _query_vector: &[f32],
            top_k: usize,
            score_threshold: f64,
        ) -> Result<Vec<SearchHit>> {
            let scores = [0.9, 0.7, 0.5, 0.31, 0.2];
            Ok(scores
                .iter()
                .filter(|s| **s >= score_threshold)
                .take(top_k)
                .enumerate()
                .map(|(i, score)| SearchHit {
                    document_id: self.docs[i % self.docs.len()].clone(),
                    chunk_id: i as u32,
                    text: format!("chunk {i}"),
                    score: *score,
                    page: 1,
                    metadata: HashMap::new(),
                })
                .collect())
        }

        async fn first_chunks(
            &self,
            _session_id: &str,
            document_id: &str,
            limit: usize,
        ) -> Result<Vec<SearchHit>> {
            if !self.docs.iter().any(|d| d == document_id) {
                return Ok(Vec::new());
            }
            Ok((0..limit.min(3))
                .map(|i| SearchHit {
                    document_id: document_id.to_string(),
                    chunk_id: i as u32,
                    text: format!("{document_id} chunk {i}"),
                    score: 0.0,
                    page: 1,
                    metadata: HashMap::new(),
                })
                .collect())
        }
    }

    fn docs(n: usize) -> Vec<DocumentRef> {
        (0..n)
            .map(|i| DocumentRef {
                id: format!("doc-{i}"),
                filename: format!("doc-{i}.pdf"),
            })
            .collect()
    }

    fn semantic(base: f64, doc_ids: Vec<String>) -> SemanticSearchStrategy {
        SemanticSearchStrategy::new(
            Arc::new(FakeIndex { docs: doc_ids }),
            Arc::new(EmbeddingService::new(|| {
                Arc::new(StaticEmbedder) as Arc<dyn Embedder>
            })),
            base,
        )
    }

    #[test]
    fn threshold_adapts_to_query_and_corpus() {
        let strategy = semantic(0.3, vec!["d".to_string()]);
        // Short query: 0.3 - 0.15
        let t = strategy.adaptive_threshold("monto total", &docs(1), None);
        assert!((t - 0.15).abs() < 1e-9);

        // Long query over a big corpus: 0.3 + 0.05 + 0.05
        let long = "una consulta muy larga con muchas palabras para superar el umbral de quince palabras en total aquí";
        let t = strategy.adaptive_threshold(long, &docs(6), None);
        assert!((t - 0.4).abs() < 1e-9);

        // Override wins and clamps.
        let t = strategy.adaptive_threshold("x", &docs(1), Some(1.5));
        assert!((t - 1.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_clamps_to_zero() {
        let strategy = semantic(0.1, vec!["d".to_string()]);
        let t = strategy.adaptive_threshold("x", &docs(1), None);
        assert_eq!(t, 0.0);
    }

    #[tokio::test]
    async fn semantic_honors_threshold_and_top_k() {
        let strategy = semantic(0.3, vec!["doc-0".to_string(), "doc-1".to_string()]);
        let documents = docs(2);
        // 6-word query keeps the base threshold of 0.3.
        let segments = strategy
            .retrieve(
                "cuál es el monto total pactado",
                "s-1",
                &documents,
                3,
                StrategyOptions::default(),
            )
            .await
            .expect("retrieve");
        assert!(segments.len() <= 3);
        assert!(segments.iter().all(|s| s.score >= 0.3));
    }

    #[tokio::test]
    async fn overview_caps_segments_and_labels_docs() {
        let ids: Vec<String> = (0..4).map(|i| format!("doc-{i}")).collect();
        let strategy = OverviewStrategy::new(Arc::new(FakeIndex { docs: ids }), 3);
        let documents = docs(4);
        let segments = strategy
            .retrieve("resumen", "s-1", &documents, 12, StrategyOptions::default())
            .await
            .expect("retrieve");
        assert!(segments.len() <= 12);
        assert!(segments.iter().all(|s| s.score == 1.0));
        let input_ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        assert!(segments.iter().all(|s| input_ids.contains(&s.doc_id)));
    }
}
