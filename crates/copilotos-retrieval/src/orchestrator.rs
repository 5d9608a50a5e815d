use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::analyze::QueryUnderstanding;
use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::strategy::{OverviewStrategy, RetrievalStrategy, SemanticSearchStrategy, StrategyOptions};
use crate::types::{
    DocumentRef, QueryComplexity, QueryContext, QueryIntent, RetrievalResult,
};

type StrategyKey = (QueryIntent, QueryComplexity);

/// Selects and runs the retrieval strategy matching the analyzed query.
///
/// Registry maps `(intent, complexity)` to a strategy; misses first try an
/// intent-only match, then the fallback semantic search. Empty results
/// trigger a second pass: overview queries retry with fewer chunks per
/// document, everything else retries semantic search with the threshold
/// forced to zero.
pub struct AdaptiveRetrievalOrchestrator {
    analyzer: Arc<dyn QueryUnderstanding>,
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    registry: HashMap<StrategyKey, Arc<dyn RetrievalStrategy>>,
    fallback: Arc<dyn RetrievalStrategy>,
}

impl AdaptiveRetrievalOrchestrator {
    pub fn new(
        analyzer: Arc<dyn QueryUnderstanding>,
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
    ) -> Self {
        let overview = |chunks: usize| -> Arc<dyn RetrievalStrategy> {
            Arc::new(OverviewStrategy::new(Arc::clone(&index), chunks))
        };
        let semantic = |threshold: f64| -> Arc<dyn RetrievalStrategy> {
            Arc::new(SemanticSearchStrategy::new(
                Arc::clone(&index),
                Arc::clone(&embeddings),
                threshold,
            ))
        };

        use QueryComplexity::*;
        use QueryIntent::*;
        let registry: HashMap<StrategyKey, Arc<dyn RetrievalStrategy>> = HashMap::from([
            ((Overview, Vague), overview(3)),
            ((Overview, Simple), overview(2)),
            ((Definitional, Simple), semantic(0.4)),
            ((Definitional, Complex), semantic(0.3)),
            ((SpecificFact, Simple), semantic(0.35)),
            ((SpecificFact, Complex), semantic(0.25)),
            ((SpecificFact, Vague), semantic(0.2)),
            ((Quantitative, Simple), semantic(0.4)),
            ((Quantitative, Complex), semantic(0.3)),
            ((Procedural, Simple), semantic(0.35)),
            ((Procedural, Complex), semantic(0.25)),
            ((Analytical, Simple), semantic(0.3)),
            ((Analytical, Complex), semantic(0.2)),
            ((Comparison, Complex), semantic(0.25)),
        ]);

        let fallback = semantic(0.3);

        info!(
            registered_strategies = registry.len(),
            "adaptive retrieval orchestrator initialized"
        );

        Self {
            analyzer,
            index,
            embeddings,
            registry,
            fallback,
        }
    }

    /// Analyze the query, pick a strategy, execute, apply fallbacks.
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        documents: &[DocumentRef],
        max_segments: usize,
        context: Option<QueryContext>,
    ) -> Result<RetrievalResult> {
        let context = context.unwrap_or_else(|| QueryContext {
            conversation_id: session_id.to_string(),
            documents_count: documents.len(),
            has_recent_entities: false,
            recent_entities: Vec::new(),
        });

        let analysis = self.analyzer.analyze_query(query, &context).await?;
        let strategy = self.select_strategy(analysis.intent, analysis.complexity);

        info!(
            intent = analysis.intent.as_str(),
            complexity = analysis.complexity.as_str(),
            strategy = strategy.name(),
            documents = documents.len(),
            "strategy selected"
        );

        let mut segments = match strategy
            .retrieve(
                &analysis.expanded_query,
                session_id,
                documents,
                max_segments,
                StrategyOptions::default(),
            )
            .await
        {
            Ok(segments) => segments,
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "retrieval execution failed");
                Vec::new()
            }
        };

        // Fallbacks on empty results.
        if segments.is_empty() {
            if analysis.intent == QueryIntent::Overview {
                warn!("overview query returned 0 segments, retrying with 2 chunks per doc");
                let retry = OverviewStrategy::new(Arc::clone(&self.index), 2);
                segments = retry
                    .retrieve(query, session_id, documents, max_segments, StrategyOptions::default())
                    .await
                    .unwrap_or_default();
            } else {
                warn!("specific query returned 0 segments, retrying with zero threshold");
                let retry = SemanticSearchStrategy::new(
                    Arc::clone(&self.index),
                    Arc::clone(&self.embeddings),
                    0.0,
                );
                segments = retry
                    .retrieve(
                        &analysis.expanded_query,
                        session_id,
                        documents,
                        max_segments,
                        StrategyOptions {
                            threshold_override: Some(0.0),
                        },
                    )
                    .await
                    .unwrap_or_default();
            }
        }

        let metadata = HashMap::from([
            ("intent".to_string(), json!(analysis.intent.as_str())),
            ("complexity".to_string(), json!(analysis.complexity.as_str())),
            (
                "query_expanded".to_string(),
                json!(analysis.expanded_query != analysis.original_query),
            ),
            ("reasoning".to_string(), json!(analysis.reasoning)),
        ]);

        let result = RetrievalResult {
            strategy_used: strategy.name().to_string(),
            confidence: analysis.confidence,
            query_analysis: Some(analysis),
            segments,
            metadata,
        };

        info!(
            segments = result.segments.len(),
            max_score = result.max_score(),
            avg_score = result.avg_score(),
            strategy = %result.strategy_used,
            "adaptive retrieval complete"
        );
        Ok(result)
    }

    fn select_strategy(
        &self,
        intent: QueryIntent,
        complexity: QueryComplexity,
    ) -> Arc<dyn RetrievalStrategy> {
        if let Some(strategy) = self.registry.get(&(intent, complexity)) {
            return Arc::clone(strategy);
        }
        // Intent-only match before giving up.
        if let Some((_, strategy)) = self.registry.iter().find(|((i, _), _)| *i == intent) {
            return Arc::clone(strategy);
        }
        Arc::clone(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::HeuristicAnalyzer;
    use crate::index::{Embedder, SearchHit};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticEmbedder;

    #[async_trait]
    impl Embedder for StaticEmbedder {
        async fn encode(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.5, 0.5])
        }
        fn dimensions(&self) -> usize {
            2
        }
    }

    /// First search returns nothing, any zero-threshold retry returns a hit.
    struct EmptyThenLowIndex {
        retried: AtomicBool,
    }

    #[async_trait]
    impl VectorIndex for EmptyThenLowIndex {
        async fn search(
            &self,
            _session_id: &str,
            _query_vector: &[f32],
            _top_k: usize,
            score_threshold: f64,
        ) -> Result<Vec<SearchHit>> {
            if score_threshold > 0.0 {
                return Ok(Vec::new());
            }
            self.retried.store(true, Ordering::SeqCst);
            Ok(vec![SearchHit {
                document_id: "doc-1".to_string(),
                chunk_id: 0,
                text: "algo".to_string(),
                score: 0.1,
                page: 1,
                metadata: HashMap::new(),
            }])
        }

        async fn first_chunks(
            &self,
            _session_id: &str,
            _document_id: &str,
            _limit: usize,
        ) -> Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
    }

    fn orchestrator(index: Arc<dyn VectorIndex>) -> AdaptiveRetrievalOrchestrator {
        AdaptiveRetrievalOrchestrator::new(
            Arc::new(HeuristicAnalyzer::new()),
            index,
            Arc::new(EmbeddingService::new(|| {
                Arc::new(StaticEmbedder) as Arc<dyn Embedder>
            })),
        )
    }

    #[tokio::test]
    async fn empty_specific_result_triggers_zero_threshold_retry() {
        let index = Arc::new(EmptyThenLowIndex {
            retried: AtomicBool::new(false),
        });
        let orch = orchestrator(Arc::clone(&index) as Arc<dyn VectorIndex>);
        let docs = vec![DocumentRef {
            id: "doc-1".to_string(),
            filename: "doc-1.pdf".to_string(),
        }];

        let result = orch
            .retrieve("cuál es el monto total pactado", "s-1", &docs, 5, None)
            .await
            .expect("retrieve");

        assert!(index.retried.load(Ordering::SeqCst));
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.strategy_used, "SemanticSearchStrategy");
    }

    #[tokio::test]
    async fn overview_reports_strategy_name() {
        let index = Arc::new(EmptyThenLowIndex {
            retried: AtomicBool::new(false),
        });
        let orch = orchestrator(index as Arc<dyn VectorIndex>);
        let docs = vec![DocumentRef {
            id: "doc-1".to_string(),
            filename: "doc-1.pdf".to_string(),
        }];
        let result = orch
            .retrieve("dame un resumen", "s-1", &docs, 5, None)
            .await
            .expect("retrieve");
        assert_eq!(result.strategy_used, "OverviewStrategy");
    }
}
