use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Section labels the models keep emitting despite prompt instructions.
const SECTION_KEYWORDS_ES: [&str; 11] = [
    "resumen",
    "respuesta",
    "desarrollo",
    "supuestos",
    "suposiciones",
    "consideraciones",
    "fuentes",
    "referencias",
    "siguientes pasos",
    "próximos pasos",
    "pasos siguientes",
];

const SECTION_KEYWORDS_EN: [&str; 9] = [
    "summary",
    "response",
    "answer",
    "development",
    "assumptions",
    "considerations",
    "sources",
    "references",
    "next steps",
];

static MD_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s*").expect("header regex"));
static BOLD_WRAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*(.*?)\*\*:?").expect("bold regex"));
static BOLD_COLON_INSIDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*(.*?):?\*\*").expect("bold-colon regex"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank-run regex"));

/// True when a line is nothing but a section label, with or without
/// markdown decoration: `**Resumen:**`, `## Fuentes`, `Summary:`.
pub fn is_section_heading(line: &str) -> bool {
    let stripped = line.trim();
    if stripped.is_empty() {
        return false;
    }

    let working = MD_HEADER.replace(stripped, "");
    let working = BOLD_WRAP.replace(&working, "$1");
    let working = BOLD_COLON_INSIDE.replace(&working, "$1");
    let normalized = working.trim_end_matches(':').trim().to_lowercase();

    SECTION_KEYWORDS_ES.contains(&normalized.as_str())
        || SECTION_KEYWORDS_EN.contains(&normalized.as_str())
}

/// Drop section-heading lines, collapse blank runs of 3+ to 2, trim.
pub fn strip_section_headings(text: &str) -> String {
    let cleaned: Vec<&str> = text
        .split('\n')
        .filter(|line| {
            let heading = is_section_heading(line);
            if heading {
                debug!(heading = line.trim(), "stripped section heading");
            }
            !heading
        })
        .collect();

    let joined = cleaned.join("\n");
    BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
}

/// Main entry point for cleaning model output before persisting or
/// returning it.
pub fn sanitize_response_content(content: &str) -> String {
    strip_section_headings(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_decorated_headings() {
        assert!(is_section_heading("**Resumen:**"));
        assert!(is_section_heading("**Resumen**:"));
        assert!(is_section_heading("Resumen:"));
        assert!(is_section_heading("## Resumen"));
        assert!(is_section_heading("## Fuentes:"));
        assert!(is_section_heading("Summary:"));
        assert!(is_section_heading("  next steps:  "));
    }

    #[test]
    fn regular_lines_are_kept() {
        assert!(!is_section_heading("El resumen del contrato dice lo siguiente"));
        assert!(!is_section_heading(""));
        assert!(!is_section_heading("- punto uno"));
    }

    #[test]
    fn strips_headings_keeps_content() {
        let input = "**Resumen:**\nContenido importante\n\n**Fuentes:**\nFuente 1";
        assert_eq!(
            strip_section_headings(input),
            "Contenido importante\n\nFuente 1"
        );
    }

    #[test]
    fn collapses_blank_runs() {
        let input = "línea uno\n\n\n\n\nlínea dos";
        assert_eq!(strip_section_headings(input), "línea uno\n\nlínea dos");
    }

    #[test]
    fn sanitize_trims_edges() {
        let input = "\n\n## Respuesta\nHola mundo\n\n";
        assert_eq!(sanitize_response_content(input), "Hola mundo");
    }
}
