use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Query intent categories the strategy registry keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Overview,
    Definitional,
    SpecificFact,
    Quantitative,
    Procedural,
    Analytical,
    Comparison,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Overview => "overview",
            QueryIntent::Definitional => "definitional",
            QueryIntent::SpecificFact => "specific_fact",
            QueryIntent::Quantitative => "quantitative",
            QueryIntent::Procedural => "procedural",
            QueryIntent::Analytical => "analytical",
            QueryIntent::Comparison => "comparison",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Vague,
    Simple,
    Complex,
}

impl QueryComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryComplexity::Vague => "vague",
            QueryComplexity::Simple => "simple",
            QueryComplexity::Complex => "complex",
        }
    }
}

/// Output of query understanding.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub intent: QueryIntent,
    pub complexity: QueryComplexity,
    pub original_query: String,
    pub expanded_query: String,
    pub confidence: f64,
    pub reasoning: String,
}

/// Conversation-level context handed to the analyzer.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub conversation_id: String,
    pub documents_count: usize,
    pub has_recent_entities: bool,
    pub recent_entities: Vec<String>,
}

/// A document eligible for retrieval in the current session.
#[derive(Debug, Clone)]
pub struct DocumentRef {
    pub id: String,
    pub filename: String,
}

/// A retrieved document chunk consumed as RAG context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub doc_id: String,
    pub doc_name: String,
    pub chunk_id: u32,
    pub text: String,
    /// Relevance score in [0, 1]. Overview retrieval is unranked (1.0).
    pub score: f64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Result of a retrieval run: segments plus decision metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub segments: Vec<Segment>,
    pub strategy_used: String,
    pub query_analysis: Option<QueryAnalysis>,
    pub confidence: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RetrievalResult {
    pub fn max_score(&self) -> f64 {
        self.segments.iter().map(|s| s.score).fold(0.0, f64::max)
    }

    pub fn avg_score(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        self.segments.iter().map(|s| s.score).sum::<f64>() / self.segments.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(score: f64) -> Segment {
        Segment {
            doc_id: "d".to_string(),
            doc_name: "d.pdf".to_string(),
            chunk_id: 0,
            text: "t".to_string(),
            score,
            page: 0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn scores_over_empty_result() {
        let result = RetrievalResult {
            segments: vec![],
            strategy_used: "SemanticSearchStrategy".to_string(),
            query_analysis: None,
            confidence: 0.0,
            metadata: HashMap::new(),
        };
        assert_eq!(result.max_score(), 0.0);
        assert_eq!(result.avg_score(), 0.0);
    }

    #[test]
    fn max_and_avg_scores() {
        let result = RetrievalResult {
            segments: vec![segment(0.2), segment(0.8)],
            strategy_used: "SemanticSearchStrategy".to_string(),
            query_analysis: None,
            confidence: 0.0,
            metadata: HashMap::new(),
        };
        assert_eq!(result.max_score(), 0.8);
        assert!((result.avg_score() - 0.5).abs() < 1e-9);
    }
}
