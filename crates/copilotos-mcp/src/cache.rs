use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use copilotos_core::cache::MemoryCache;

/// Per-tool result TTLs in seconds. Audit findings are stable for an hour,
/// spreadsheet data may move, research is expensive enough to keep a day.
fn ttl_for(tool: &str) -> u64 {
    match tool {
        "audit_file" => 3600,
        "excel_analyzer" => 1800,
        "deep_research" => 86_400,
        "extract_text" => 3600,
        _ => 3600,
    }
}

/// Cache stats snapshot, counted from live keys.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub by_tool: HashMap<String, usize>,
    pub by_document: HashMap<String, usize>,
}

/// Tool result cache over the shared KV store.
///
/// Key layout: `mcp:tool:<tool>:<doc_id>:<params-hash-8hex>`. Writers do
/// not coordinate — inputs define the key, so last-writer-wins is sound.
pub struct ToolResultCache {
    cache: Arc<MemoryCache>,
}

impl ToolResultCache {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self { cache }
    }

    /// Build the cache key. serde_json maps serialize with sorted keys, so
    /// equal params always hash identically.
    pub fn cache_key(tool: &str, doc_id: &str, params: &Value) -> String {
        let params_str = serde_json::to_string(params).unwrap_or_default();
        let digest = md5::compute(params_str.as_bytes());
        let hash = &format!("{digest:x}")[..8];
        format!("mcp:tool:{tool}:{doc_id}:{hash}")
    }

    pub fn get(&self, tool: &str, doc_id: &str, params: &Value) -> Option<Value> {
        let key = Self::cache_key(tool, doc_id, params);
        let hit = self.cache.get(&key);
        debug!(tool, doc_id, key = %key, hit = hit.is_some(), "tool cache lookup");
        hit
    }

    pub fn set(&self, tool: &str, doc_id: &str, params: &Value, result: Value) {
        let key = Self::cache_key(tool, doc_id, params);
        let ttl = ttl_for(tool);
        self.cache
            .set(key.clone(), result, Some(Duration::from_secs(ttl)));
        debug!(tool, doc_id, key = %key, ttl, "tool result cached");
    }

    /// Delete the single key for (tool, doc, default params).
    pub fn invalidate_tool_cache(&self, tool: &str, doc_id: &str, params: &Value) -> bool {
        let key = Self::cache_key(tool, doc_id, params);
        let removed = self.cache.delete(&key);
        info!(tool, doc_id, removed, "tool cache invalidated");
        removed
    }

    /// Delete every cached result for a document, optionally only one tool.
    pub fn invalidate_document_tool_cache(&self, doc_id: &str, tool: Option<&str>) -> usize {
        let pattern = match tool {
            Some(tool) => format!("mcp:tool:{tool}:{doc_id}:*"),
            None => format!("mcp:tool:*:{doc_id}:*"),
        };
        let removed = self.cache.delete_matching(&pattern);
        info!(doc_id, ?tool, removed, "document tool cache invalidated");
        removed
    }

    /// Destructive: clears every tool result (optionally one tool). The API
    /// surface requires an explicit confirmation flag before calling this.
    pub fn invalidate_all_tool_caches(&self, tool: Option<&str>) -> usize {
        let pattern = match tool {
            Some(tool) => format!("mcp:tool:{tool}:*"),
            None => "mcp:tool:*".to_string(),
        };
        let removed = self.cache.delete_matching(&pattern);
        warn!(?tool, removed, "all tool caches invalidated");
        removed
    }

    /// Counts by tool and by document, optionally restricted to one doc.
    pub fn stats(&self, doc_id: Option<&str>) -> CacheStats {
        let pattern = match doc_id {
            Some(doc) => format!("mcp:tool:*:{doc}:*"),
            None => "mcp:tool:*".to_string(),
        };
        let keys = self.cache.scan(&pattern);

        let mut by_tool: HashMap<String, usize> = HashMap::new();
        let mut by_document: HashMap<String, usize> = HashMap::new();
        for key in &keys {
            // mcp:tool:<tool>:<doc>:<hash>
            let parts: Vec<&str> = key.split(':').collect();
            if parts.len() == 5 {
                *by_tool.entry(parts[2].to_string()).or_default() += 1;
                *by_document.entry(parts[3].to_string()).or_default() += 1;
            }
        }

        CacheStats {
            total_entries: keys.len(),
            by_tool,
            by_document,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> ToolResultCache {
        ToolResultCache::new(Arc::new(MemoryCache::new()))
    }

    #[test]
    fn identical_params_produce_identical_keys() {
        // serde_json object keys are sorted, so insertion order is moot.
        let a = json!({"policy_id": "auto", "enable_format": true});
        let b = json!({"enable_format": true, "policy_id": "auto"});
        assert_eq!(
            ToolResultCache::cache_key("audit_file", "doc-1", &a),
            ToolResultCache::cache_key("audit_file", "doc-1", &b),
        );
    }

    #[test]
    fn key_layout() {
        let key = ToolResultCache::cache_key("audit_file", "doc-1", &json!({}));
        assert!(key.starts_with("mcp:tool:audit_file:doc-1:"));
        let hash = key.rsplit(':').next().expect("hash segment");
        assert_eq!(hash.len(), 8);
    }

    #[test]
    fn set_get_invalidate() {
        let cache = cache();
        let params = json!({"policy_id": "auto"});
        cache.set("audit_file", "doc-1", &params, json!({"findings": 3}));
        assert_eq!(
            cache.get("audit_file", "doc-1", &params),
            Some(json!({"findings": 3}))
        );
        assert!(cache.invalidate_tool_cache("audit_file", "doc-1", &params));
        assert!(cache.get("audit_file", "doc-1", &params).is_none());
    }

    #[test]
    fn document_invalidation_matches_all_tools() {
        let cache = cache();
        cache.set("audit_file", "doc-1", &json!({"a": 1}), json!(1));
        cache.set("viz_tool", "doc-1", &json!({"b": 2}), json!(2));
        cache.set("audit_file", "doc-2", &json!({"a": 1}), json!(3));

        assert_eq!(cache.invalidate_document_tool_cache("doc-1", None), 2);
        assert!(cache.get("audit_file", "doc-2", &json!({"a": 1})).is_some());
    }

    #[test]
    fn stats_count_by_tool_and_document() {
        let cache = cache();
        cache.set("audit_file", "doc-1", &json!({"a": 1}), json!(1));
        cache.set("audit_file", "doc-2", &json!({"a": 1}), json!(2));
        cache.set("viz_tool", "doc-1", &json!({"b": 1}), json!(3));

        let stats = cache.stats(None);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.by_tool["audit_file"], 2);
        assert_eq!(stats.by_document["doc-1"], 2);

        let doc_stats = cache.stats(Some("doc-1"));
        assert_eq!(doc_stats.total_entries, 2);
    }
}
