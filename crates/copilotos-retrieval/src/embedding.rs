use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::error::Result;
use crate::index::Embedder;

const QUERY_CACHE_ENTRIES: usize = 1000;

type EmbedderFactory = Box<dyn Fn() -> Arc<dyn Embedder> + Send + Sync>;

/// Fronts the embedding model with lazy initialization and a small LRU
/// query cache.
///
/// The backend is constructed on the first `encode` call — model loading
/// is expensive and must not block server startup. The cache maps a
/// normalized-text hash to the vector, so repeated queries in a session
/// skip the model entirely.
pub struct EmbeddingService {
    factory: EmbedderFactory,
    backend: OnceCell<Arc<dyn Embedder>>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(factory: impl Fn() -> Arc<dyn Embedder> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            backend: OnceCell::new(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_ENTRIES).expect("nonzero cache size"),
            )),
        }
    }

    pub async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let key = cache_key(text);

        {
            let mut cache = self.cache.lock().await;
            if let Some(vector) = cache.get(&key) {
                debug!(key = %key, "embedding cache hit");
                return Ok(vector.clone());
            }
        }

        let backend = self
            .backend
            .get_or_init(|| async {
                let backend = (self.factory)();
                info!(dimensions = backend.dimensions(), "embedding backend initialized");
                backend
            })
            .await;

        let vector = backend.encode(text).await?;
        self.cache.lock().await.put(key, vector.clone());
        Ok(vector)
    }

    /// True once the backend has been constructed.
    pub fn initialized(&self) -> bool {
        self.backend.initialized()
    }
}

fn cache_key(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..16])
}
