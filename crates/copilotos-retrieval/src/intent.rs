use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Message-level intent labels exposed by the intent endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntentLabel {
    Greeting,
    ChitChat,
    Command,
    Researchable,
    Ambiguous,
    MultiTopic,
}

impl IntentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Greeting => "Greeting",
            IntentLabel::ChitChat => "ChitChat",
            IntentLabel::Command => "Command",
            IntentLabel::Researchable => "Researchable",
            IntentLabel::Ambiguous => "Ambiguous",
            IntentLabel::MultiTopic => "MultiTopic",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentPrediction {
    pub intent: IntentLabel,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub model: &'static str,
}

const MIN_CONFIDENCE: f64 = 0.35;

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(hola|hey|buen[oa]s|qué tal|buenas tardes|buenos días)\b")
        .expect("greeting regex")
});
static COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(configura|establece|crea|actualiza|ejecuta|borra|elimina|lanza|genera)\b")
        .expect("command regex")
});
static RESEARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(impacto|comparativa|tendencia|riesgo|mercado|benchmark|pronóstico|forecast|análisis)\b",
    )
    .expect("research regex")
});
static QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\?|\b(qué|como|cómo|por qué|por que|cuando|cuándo|donde|dónde|cuál|cual)\b)")
        .expect("question regex")
});

/// Heuristic intent classifier for incoming chat messages.
#[derive(Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> IntentPrediction {
        let trimmed = text.trim();
        let mut signals: Vec<(IntentLabel, f64, String)> = Vec::new();

        if GREETING.is_match(trimmed) {
            signals.push((IntentLabel::Greeting, 0.9, "greeting opener".to_string()));
        }
        if COMMAND.is_match(trimmed) {
            signals.push((IntentLabel::Command, 0.8, "imperative verb".to_string()));
        }
        if RESEARCH.is_match(trimmed) {
            signals.push((
                IntentLabel::Researchable,
                0.75,
                "research keyword".to_string(),
            ));
        }
        // Several sentences each carrying a question mark suggests the user
        // packed multiple topics into one message.
        if trimmed.matches('?').count() > 1 {
            signals.push((
                IntentLabel::MultiTopic,
                0.6,
                "multiple questions".to_string(),
            ));
        }
        if signals.is_empty() && QUESTION.is_match(trimmed) {
            signals.push((IntentLabel::ChitChat, 0.5, "single question".to_string()));
        }

        match signals
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            Some((intent, score, reason)) => IntentPrediction {
                intent,
                confidence: score.clamp(MIN_CONFIDENCE, 1.0),
                reasons: vec![reason],
                model: "heuristic",
            },
            None => IntentPrediction {
                intent: IntentLabel::Ambiguous,
                confidence: MIN_CONFIDENCE,
                reasons: vec!["no heuristic match".to_string()],
                model: "heuristic",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_wins() {
        let p = IntentClassifier::new().classify("Hola, ¿cómo estás?");
        assert_eq!(p.intent, IntentLabel::Greeting);
        assert!(p.confidence >= MIN_CONFIDENCE);
    }

    #[test]
    fn command_detected() {
        let p = IntentClassifier::new().classify("genera el reporte mensual");
        assert_eq!(p.intent, IntentLabel::Command);
    }

    #[test]
    fn research_keywords() {
        let p = IntentClassifier::new().classify("análisis del mercado asegurador en 2025");
        assert_eq!(p.intent, IntentLabel::Researchable);
    }

    #[test]
    fn fallback_is_ambiguous() {
        let p = IntentClassifier::new().classify("zzz");
        assert_eq!(p.intent, IntentLabel::Ambiguous);
        assert_eq!(p.confidence, MIN_CONFIDENCE);
    }
}
