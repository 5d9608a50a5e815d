use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::spec::RateLimitConfig;

/// Authorization scopes. Format: `mcp:category.action`; a trailing `.*`
/// grants the whole category.
pub mod scopes {
    pub const TOOLS_ALL: &str = "mcp:tools.*";
    pub const TOOLS_AUDIT: &str = "mcp:tools.audit";
    pub const TOOLS_ANALYTICS: &str = "mcp:tools.analytics";
    pub const TOOLS_VIZ: &str = "mcp:tools.viz";
    pub const TOOLS_RESEARCH: &str = "mcp:tools.research";

    pub const ADMIN_ALL: &str = "mcp:admin.*";
    pub const ADMIN_TOOLS_MANAGE: &str = "mcp:admin.tools.manage";
    pub const ADMIN_METRICS: &str = "mcp:admin.metrics";

    pub const TASKS_CREATE: &str = "mcp:tasks.create";
    pub const TASKS_READ: &str = "mcp:tasks.read";
    pub const TASKS_CANCEL: &str = "mcp:tasks.cancel";
}

/// Scope a tool requires, or `None` for unrestricted tools.
pub fn required_scope(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "audit_file" => Some(scopes::TOOLS_AUDIT),
        "excel_analyzer" => Some(scopes::TOOLS_ANALYTICS),
        "viz_tool" => Some(scopes::TOOLS_VIZ),
        "deep_research" => Some(scopes::TOOLS_RESEARCH),
        _ => None,
    }
}

/// Check a scope against the user's set, honoring category wildcards:
/// `mcp:tools.*` grants every `mcp:tools.x`, `mcp:*` grants the namespace.
pub fn check_scope(user_scopes: &HashSet<String>, required: &str) -> bool {
    if user_scopes.contains(required) {
        return true;
    }
    if let Some((category, action)) = required.split_once(':') {
        if let Some((group, _)) = action.split_once('.') {
            if user_scopes.contains(&format!("{category}:{group}.*")) {
                return true;
            }
        }
        if user_scopes.contains(&format!("{category}:*")) {
            return true;
        }
    }
    false
}

/// Sliding-window rate limiter over two windows (per-minute, per-hour).
///
/// Each admitted request records a timestamp under both window keys; a
/// request is admitted iff the in-window count is below the limit for
/// both. State is process-local (see `MemoryCache` note on replicas).
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Vec<f64>>,
}

/// Outcome of a rejected rate check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimited {
    pub retry_after_ms: u64,
}

const MINUTE_WINDOW: f64 = 60.0;
const HOUR_WINDOW: f64 = 3600.0;

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a request for `key` (e.g. `"<user>:<tool>"`).
    pub fn check(&self, key: &str, config: RateLimitConfig) -> Result<(), RateLimited> {
        self.check_at(key, config, now_secs())
    }

    /// Clock-injectable variant used by tests.
    pub fn check_at(&self, key: &str, config: RateLimitConfig, now: f64) -> Result<(), RateLimited> {
        let minute_key = format!("ratelimit:minute:{key}");
        let hour_key = format!("ratelimit:hour:{key}");

        if let Some(retry) = self.window_reject(
            &minute_key,
            now,
            MINUTE_WINDOW,
            config.calls_per_minute,
        ) {
            warn!(key, window = "minute", retry_after_ms = retry, "rate limit exceeded");
            return Err(RateLimited { retry_after_ms: retry });
        }
        if let Some(retry) = self.window_reject(&hour_key, now, HOUR_WINDOW, config.calls_per_hour)
        {
            warn!(key, window = "hour", retry_after_ms = retry, "rate limit exceeded");
            return Err(RateLimited { retry_after_ms: retry });
        }

        self.record(&minute_key, now, 2.0 * MINUTE_WINDOW);
        self.record(&hour_key, now, 2.0 * HOUR_WINDOW);
        Ok(())
    }

    /// Returns `retry_after_ms` when the window is saturated.
    fn window_reject(&self, key: &str, now: f64, window: f64, limit: u32) -> Option<u64> {
        let entry = self.windows.get(key)?;
        let since = now - window;
        let in_window: Vec<f64> = entry.iter().copied().filter(|t| *t >= since).collect();
        if (in_window.len() as u32) < limit {
            return None;
        }
        let oldest = in_window.iter().copied().fold(f64::INFINITY, f64::min);
        let retry_ms = ((oldest + window - now) * 1000.0).max(0.0);
        Some(retry_ms as u64)
    }

    fn record(&self, key: &str, now: f64, ttl: f64) {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.push(now);
        let cutoff = now - ttl;
        entry.retain(|t| *t > cutoff);
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Payload validation gates applied before any tool code runs.
pub struct PayloadValidator;

pub const MAX_STRING_LENGTH: usize = 10_000;
pub const MAX_ARRAY_LENGTH: usize = 1_000;
pub const MAX_NESTING_DEPTH: usize = 10;
pub const MAX_KEY_LENGTH: usize = 100;

impl PayloadValidator {
    /// Serialized payload must fit the size budget.
    pub fn validate_size(payload: &Value, max_size_kb: usize) -> Result<(), String> {
        let bytes = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
        let size_kb = bytes.len() as f64 / 1024.0;
        if size_kb > max_size_kb as f64 {
            return Err(format!(
                "payload too large: {size_kb:.2}KB exceeds limit of {max_size_kb}KB"
            ));
        }
        Ok(())
    }

    /// Structural limits: nesting depth, key length, string length, array
    /// length. Applied recursively.
    pub fn validate_structure(payload: &Value) -> Result<(), String> {
        Self::validate_inner(payload, 0)
    }

    fn validate_inner(value: &Value, depth: usize) -> Result<(), String> {
        if depth > MAX_NESTING_DEPTH {
            return Err(format!("payload nesting too deep (max: {MAX_NESTING_DEPTH})"));
        }
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    if key.len() > MAX_KEY_LENGTH {
                        return Err(format!(
                            "key too long: {} chars (max: {MAX_KEY_LENGTH})",
                            key.len()
                        ));
                    }
                    Self::validate_inner(inner, depth + 1)?;
                }
            }
            Value::Array(items) => {
                if items.len() > MAX_ARRAY_LENGTH {
                    return Err(format!(
                        "array too long: {} items (max: {MAX_ARRAY_LENGTH})",
                        items.len()
                    ));
                }
                for item in items {
                    Self::validate_inner(item, depth + 1)?;
                }
            }
            Value::String(s) => {
                if s.len() > MAX_STRING_LENGTH {
                    return Err(format!(
                        "string too long: {} chars (max: {MAX_STRING_LENGTH})",
                        s.len()
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(per_minute: u32, per_hour: u32) -> RateLimitConfig {
        RateLimitConfig {
            calls_per_minute: per_minute,
            calls_per_hour: per_hour,
        }
    }

    #[test]
    fn wildcard_scope_grants_category() {
        let scopes_set: HashSet<String> = HashSet::from(["mcp:tools.*".to_string()]);
        assert!(check_scope(&scopes_set, scopes::TOOLS_AUDIT));
        assert!(check_scope(&scopes_set, scopes::TOOLS_VIZ));
        assert!(!check_scope(&scopes_set, scopes::ADMIN_METRICS));
    }

    #[test]
    fn exact_scope_and_namespace_wildcard() {
        let exact: HashSet<String> = HashSet::from(["mcp:tools.audit".to_string()]);
        assert!(check_scope(&exact, scopes::TOOLS_AUDIT));
        assert!(!check_scope(&exact, scopes::TOOLS_VIZ));

        let all: HashSet<String> = HashSet::from(["mcp:*".to_string()]);
        assert!(check_scope(&all, scopes::ADMIN_METRICS));
    }

    #[test]
    fn sixty_first_call_in_minute_is_rejected() {
        let limiter = RateLimiter::new();
        let cfg = config(60, 600);
        let base = 1_000_000.0;
        for i in 0..60 {
            limiter
                .check_at("u1:audit_file", cfg, base + i as f64 * 0.5)
                .expect("admitted");
        }
        let err = limiter
            .check_at("u1:audit_file", cfg, base + 30.0)
            .unwrap_err();
        assert!(err.retry_after_ms > 0);
    }

    #[test]
    fn call_admitted_after_oldest_expires() {
        let limiter = RateLimiter::new();
        let cfg = config(2, 600);
        let base = 2_000_000.0;
        limiter.check_at("k", cfg, base).expect("1st");
        limiter.check_at("k", cfg, base + 1.0).expect("2nd");
        assert!(limiter.check_at("k", cfg, base + 2.0).is_err());
        // Oldest timestamp slides out of the 60 s window.
        limiter.check_at("k", cfg, base + 61.0).expect("readmitted");
    }

    #[test]
    fn hour_window_applies_independently() {
        let limiter = RateLimiter::new();
        let cfg = config(1000, 3);
        let base = 3_000_000.0;
        // Spread out so the minute window never trips.
        for i in 0..3 {
            limiter.check_at("k", cfg, base + i as f64 * 120.0).expect("admitted");
        }
        let err = limiter.check_at("k", cfg, base + 400.0).unwrap_err();
        assert!(err.retry_after_ms > 0);
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = RateLimiter::new();
        let cfg = config(1, 10);
        let base = 4_000_000.0;
        limiter.check_at("a:t", cfg, base).expect("a admitted");
        limiter.check_at("b:t", cfg, base).expect("b admitted");
        assert!(limiter.check_at("a:t", cfg, base + 1.0).is_err());
    }

    #[test]
    fn size_gate() {
        let small = json!({"a": "b"});
        assert!(PayloadValidator::validate_size(&small, 1).is_ok());
        let big = json!({"a": "x".repeat(2048)});
        assert!(PayloadValidator::validate_size(&big, 1).is_err());
    }

    #[test]
    fn structure_gate_depth() {
        let mut value = json!("leaf");
        for _ in 0..12 {
            value = json!({ "nested": value });
        }
        assert!(PayloadValidator::validate_structure(&value).is_err());
    }

    #[test]
    fn structure_gate_string_and_array() {
        let long_string = json!({"s": "y".repeat(MAX_STRING_LENGTH + 1)});
        assert!(PayloadValidator::validate_structure(&long_string).is_err());

        let long_array = json!({"a": vec![0; MAX_ARRAY_LENGTH + 1]});
        assert!(PayloadValidator::validate_structure(&long_array).is_err());

        let long_key = json!({"k".repeat(MAX_KEY_LENGTH + 1): 1});
        assert!(PayloadValidator::validate_structure(&long_key).is_err());

        assert!(PayloadValidator::validate_structure(&json!({"ok": [1, 2, 3]})).is_ok());
    }
}
