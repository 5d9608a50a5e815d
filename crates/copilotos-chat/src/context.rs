use std::sync::Arc;

use tracing::{info, warn};

use copilotos_core::cache::MemoryCache;
use copilotos_core::types::{extraction_cache_key, ExtractedDocument};

pub const MAX_CHARS_PER_DOC: usize = 8000;
pub const MAX_TOTAL_CHARS: usize = 16_000;
pub const MAX_DOCS: usize = 3;

/// Combined RAG context ready for prompt injection.
#[derive(Debug, Clone, Default)]
pub struct RagExtraction {
    pub combined: String,
    /// Requested ids that were missing from the cache or not owned.
    pub warnings: Vec<String>,
    /// Docs cut short by the per-doc or global budget.
    pub truncated_docs: Vec<String>,
    pub docs_used: usize,
}

/// Ownership-checked reads of previously extracted document text.
pub struct DocumentContextCache {
    cache: Arc<MemoryCache>,
}

impl DocumentContextCache {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self { cache }
    }

    /// Look up extracted text by file id in request order. Entries owned
    /// by a different user are silently dropped with a warning log.
    pub fn get_document_text_from_cache(
        &self,
        document_ids: &[String],
        user_id: &str,
    ) -> Vec<ExtractedDocument> {
        let mut docs = Vec::new();
        for id in document_ids {
            let Some(value) = self.cache.get(&extraction_cache_key(id)) else {
                continue;
            };
            let Ok(doc) = serde_json::from_value::<ExtractedDocument>(value) else {
                warn!(doc_id = %id, "malformed extraction cache entry");
                continue;
            };
            if doc.user_id != user_id {
                warn!(doc_id = %id, "dropping document not owned by requester");
                continue;
            }
            docs.push(doc);
        }
        docs
    }

    /// Assemble the combined context string within the per-doc and global
    /// character budgets. Each document is prefixed with its filename.
    pub fn extract_content_for_rag(
        &self,
        docs: &[ExtractedDocument],
        requested_ids: &[String],
        max_chars_per_doc: usize,
        max_total_chars: usize,
        max_docs: usize,
    ) -> RagExtraction {
        let mut extraction = RagExtraction::default();

        let found: Vec<&str> = docs.iter().map(|d| d.file_id.as_str()).collect();
        for id in requested_ids {
            if !found.contains(&id.as_str()) {
                extraction
                    .warnings
                    .push(format!("documento '{id}' no disponible en caché"));
            }
        }

        let mut remaining = max_total_chars;
        for doc in docs.iter().take(max_docs) {
            if remaining == 0 {
                extraction.truncated_docs.push(doc.filename.clone());
                continue;
            }
            let header = format!("[Archivo: {}]\n", doc.filename);
            let budget = remaining.saturating_sub(header.len()).min(max_chars_per_doc);

            let text = doc.text.trim();
            let slice = truncate_on_char_boundary(text, budget);
            if slice.len() < text.len() {
                extraction.truncated_docs.push(doc.filename.clone());
            }

            extraction.combined.push_str(&header);
            extraction.combined.push_str(slice);
            extraction.combined.push_str("\n\n");
            remaining = remaining.saturating_sub(header.len() + slice.len());
            extraction.docs_used += 1;
        }

        if docs.len() > max_docs {
            for doc in docs.iter().skip(max_docs) {
                extraction
                    .warnings
                    .push(format!("documento '{}' omitido por límite de documentos", doc.file_id));
            }
        }

        extraction.combined = extraction.combined.trim_end().to_string();
        info!(
            docs_used = extraction.docs_used,
            combined_chars = extraction.combined.len(),
            warnings = extraction.warnings.len(),
            truncated = extraction.truncated_docs.len(),
            "rag context assembled"
        );
        extraction
    }

    /// Convenience wrapper: cache lookup + budget assembly with defaults.
    pub fn build_rag_context(&self, document_ids: &[String], user_id: &str) -> RagExtraction {
        let docs = self.get_document_text_from_cache(document_ids, user_id);
        self.extract_content_for_rag(
            &docs,
            document_ids,
            MAX_CHARS_PER_DOC,
            MAX_TOTAL_CHARS,
            MAX_DOCS,
        )
    }
}

fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
