use std::sync::Arc;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use copilotos_core::ApiError;
use copilotos_retrieval::types::DocumentRef;

use crate::app::AppState;
use crate::middleware::AuthUser;
use crate::problem::{ApiProblem, ApiResult};
use crate::retrieval::chunk_text;

#[derive(Debug, Deserialize)]
pub struct IndexRequest {
    pub session_id: String,
}

/// POST /api/documents/{id}/index — chunk and embed a document's
/// extracted text into the session's vector index. Ownership is enforced
/// by the extraction-cache read.
pub async fn index_document(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(req): Json<IndexRequest>,
) -> ApiResult<Json<Value>> {
    let docs = state
        .chat
        .docs()
        .get_document_text_from_cache(&[id.clone()], &auth.user_id);
    let Some(doc) = docs.into_iter().next() else {
        return Err(ApiProblem(ApiError::NotFound(format!(
            "documento {id} sin texto extraído"
        ))));
    };

    let chunks = chunk_text(&doc.text);
    let mut stored = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let vector = state
            .embeddings
            .encode(chunk)
            .await
            .map_err(|e| ApiProblem(ApiError::Execution(e.to_string())))?;
        stored.push((i as u32, chunk.clone(), vector, doc.pages.unwrap_or(0)));
    }
    let chunk_count = stored.len();
    state
        .vector_index
        .upsert_document(&req.session_id, &doc.file_id, stored);

    info!(
        doc_id = %doc.file_id,
        session_id = %req.session_id,
        chunks = chunk_count,
        "document indexed"
    );
    Ok(Json(json!({
        "document_id": doc.file_id,
        "session_id": req.session_id,
        "chunks_indexed": chunk_count,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub session_id: String,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
}

fn default_max_segments() -> usize {
    8
}

/// POST /api/documents/search — adaptive retrieval over the session's
/// indexed documents.
pub async fn search_documents(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<Value>> {
    if req.query.trim().is_empty() {
        return Err(ApiProblem(ApiError::MissingField {
            field: "query".to_string(),
        }));
    }

    // Resolve the document names via the extraction cache where possible.
    let doc_ids = state.vector_index.documents(&req.session_id);
    let extracted = state
        .chat
        .docs()
        .get_document_text_from_cache(&doc_ids, &auth.user_id);
    let documents: Vec<DocumentRef> = doc_ids
        .iter()
        .map(|id| DocumentRef {
            id: id.clone(),
            filename: extracted
                .iter()
                .find(|d| &d.file_id == id)
                .map(|d| d.filename.clone())
                .unwrap_or_else(|| id.clone()),
        })
        .collect();

    let result = state
        .retrieval
        .retrieve(
            &req.query,
            &req.session_id,
            &documents,
            req.max_segments.min(50),
            None,
        )
        .await
        .map_err(|e| ApiProblem(ApiError::Execution(e.to_string())))?;

    Ok(Json(json!({
        "segments": result.segments,
        "strategy_used": result.strategy_used,
        "confidence": result.confidence,
        "max_score": result.max_score(),
        "avg_score": result.avg_score(),
        "metadata": result.metadata,
    })))
}
