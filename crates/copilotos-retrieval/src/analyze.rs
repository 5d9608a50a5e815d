use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::types::{QueryAnalysis, QueryComplexity, QueryContext, QueryIntent};

/// Query understanding capability.
///
/// The production deployment may back this with an LLM classifier; the
/// default implementation below is a pure keyword heuristic so retrieval
/// works offline and deterministically.
#[async_trait]
pub trait QueryUnderstanding: Send + Sync {
    async fn analyze_query(&self, query: &str, context: &QueryContext) -> Result<QueryAnalysis>;
}

static OVERVIEW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(resumen|resume|de qué trata|overview|summary|en general|contenido)\b")
        .expect("overview regex")
});
static DEFINITIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(qué es|que es|qué significa|define|definición|what is|meaning of)\b")
        .expect("definitional regex")
});
static QUANTITATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(cuánto|cuanto|cuántos|cuantos|monto|total|porcentaje|cifra|how (much|many))\b")
        .expect("quantitative regex")
});
static PROCEDURAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(cómo|como se|pasos|procedimiento|how (do|to))\b").expect("procedural regex")
});
static ANALYTICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(por qué|por que|razón|causa|impacto|análisis|why)\b")
        .expect("analytical regex")
});
static COMPARISON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(compara|comparación|diferencia|versus|vs\.?|mejor que|frente a)\b")
        .expect("comparison regex")
});

/// Keyword-heuristic analyzer. Confidence is modest by construction; the
/// orchestrator treats it as advisory only.
#[derive(Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn classify_intent(query: &str) -> (QueryIntent, &'static str) {
        if OVERVIEW.is_match(query) {
            (QueryIntent::Overview, "overview keyword")
        } else if COMPARISON.is_match(query) {
            (QueryIntent::Comparison, "comparison keyword")
        } else if DEFINITIONAL.is_match(query) {
            (QueryIntent::Definitional, "definitional keyword")
        } else if QUANTITATIVE.is_match(query) {
            (QueryIntent::Quantitative, "quantitative keyword")
        } else if PROCEDURAL.is_match(query) {
            (QueryIntent::Procedural, "procedural keyword")
        } else if ANALYTICAL.is_match(query) {
            (QueryIntent::Analytical, "analytical keyword")
        } else {
            (QueryIntent::SpecificFact, "no category keyword, assuming fact lookup")
        }
    }

    fn classify_complexity(query: &str) -> QueryComplexity {
        let words = query.split_whitespace().count();
        if words < 4 {
            QueryComplexity::Vague
        } else if words > 12 {
            QueryComplexity::Complex
        } else {
            QueryComplexity::Simple
        }
    }
}

#[async_trait]
impl QueryUnderstanding for HeuristicAnalyzer {
    async fn analyze_query(&self, query: &str, context: &QueryContext) -> Result<QueryAnalysis> {
        let (intent, reason) = Self::classify_intent(query);
        let complexity = Self::classify_complexity(query);

        // Expansion: vague follow-ups inherit recently mentioned entities so
        // the embedding has something to bite on.
        let expanded_query = if complexity == QueryComplexity::Vague && context.has_recent_entities
        {
            format!("{} {}", query, context.recent_entities.join(" "))
        } else {
            query.to_string()
        };

        let analysis = QueryAnalysis {
            intent,
            complexity,
            original_query: query.to_string(),
            expanded_query,
            confidence: 0.55,
            reasoning: reason.to_string(),
        };
        debug!(
            intent = intent.as_str(),
            complexity = complexity.as_str(),
            expanded = analysis.expanded_query != analysis.original_query,
            "query analyzed"
        );
        Ok(analysis)
    }
}
