use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// Process-local TTL key/value cache.
///
/// Backs the tool result cache, token blacklist, rate-limiter state and
/// cached history reads. State lives in this process only — across
/// replicas it is eventually inconsistent, which is acceptable for a
/// single-node deployment and must be revisited before scaling out.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a value. Expired entries are dropped lazily on read.
    pub fn get(&self, key: &str) -> Option<Value> {
        let hit = {
            let entry = self.entries.get(key)?;
            if entry.expired() {
                None
            } else {
                Some(entry.value.clone())
            }
        };
        if hit.is_none() {
            self.entries.remove(key);
            debug!(key, "cache entry expired");
        }
        hit
    }

    /// Store a value with an optional TTL.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    /// Remove a key. Returns true when it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// List live keys matching a glob-ish pattern where `*` matches any run
    /// of characters (e.g. `mcp:tool:*:doc-1:*`).
    pub fn scan(&self, pattern: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.value().expired() && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Delete every key matching the pattern. Returns the number removed.
    pub fn delete_matching(&self, pattern: &str) -> usize {
        let keys = self.scan(pattern);
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Number of live entries (expired entries are swept first).
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.expired());
    }
}

/// Minimal glob matcher: `*` matches any (possibly empty) run of characters.
/// Segments between stars must appear in order; the first and last segments
/// anchor to the start and end of the key.
fn glob_match(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_roundtrip() {
        let cache = MemoryCache::new();
        cache.set("k", json!({"a": 1}), None);
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn scan_matches_tool_cache_layout() {
        let cache = MemoryCache::new();
        cache.set("mcp:tool:audit_file:doc-1:abcd1234", json!(1), None);
        cache.set("mcp:tool:viz_tool:doc-1:ffff0000", json!(2), None);
        cache.set("mcp:tool:audit_file:doc-2:abcd1234", json!(3), None);

        let mut hits = cache.scan("mcp:tool:*:doc-1:*");
        hits.sort();
        assert_eq!(
            hits,
            vec![
                "mcp:tool:audit_file:doc-1:abcd1234".to_string(),
                "mcp:tool:viz_tool:doc-1:ffff0000".to_string(),
            ]
        );
    }

    #[test]
    fn delete_matching_removes_only_matches() {
        let cache = MemoryCache::new();
        cache.set("mcp:tool:audit_file:doc-1:aa", json!(1), None);
        cache.set("mcp:tool:audit_file:doc-2:bb", json!(2), None);
        assert_eq!(cache.delete_matching("mcp:tool:*:doc-1:*"), 1);
        assert!(cache.get("mcp:tool:audit_file:doc-2:bb").is_some());
    }

    #[test]
    fn glob_anchors_both_ends() {
        assert!(glob_match("blacklist:*", "blacklist:tok"));
        assert!(!glob_match("blacklist:*", "prefix:blacklist:tok"));
        assert!(glob_match("*:suffix", "any:suffix"));
        assert!(!glob_match("*:suffix", "any:suffix:more"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }
}
