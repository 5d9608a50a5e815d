use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::spec::ToolSpec;
use crate::tool::Tool;

type ToolFactory = Box<dyn Fn() -> Arc<dyn Tool> + Send + Sync>;

/// Static metadata advertised before a tool is ever constructed.
struct ToolDescriptor {
    category: String,
    description: String,
    factory: ToolFactory,
}

/// Minimal discovery record — no tool construction involved.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredTool {
    pub name: String,
    pub category: String,
    pub description: String,
    pub loaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LazyRegistryStats {
    pub tools_discovered: usize,
    pub tools_loaded: usize,
    /// Share of discovered tools not holding memory: (discovered - loaded) / discovered.
    pub memory_efficiency: f64,
}

/// Registry that defers tool construction until first use.
///
/// Construction can be expensive (auditor pipelines, template banks), so
/// discovery works off static descriptors and `unload_tool` frees a
/// cached instance again.
#[derive(Default)]
pub struct LazyToolRegistry {
    descriptors: HashMap<String, ToolDescriptor>,
    loaded: DashMap<String, Arc<dyn Tool>>,
}

impl LazyToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory with the metadata shown before loading.
    pub fn register_factory(
        &mut self,
        name: impl Into<String>,
        category: impl Into<String>,
        description: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Tool> + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!(tool = %name, "lazy tool factory registered");
        self.descriptors.insert(
            name,
            ToolDescriptor {
                category: category.into(),
                description: description.into(),
                factory: Box::new(factory),
            },
        );
    }

    /// Discovery without construction, optionally filtered.
    pub fn discover(&self, category: Option<&str>, search: Option<&str>) -> Vec<DiscoveredTool> {
        let mut tools: Vec<DiscoveredTool> = self
            .descriptors
            .iter()
            .filter(|(_, d)| category.is_none_or(|c| d.category == c))
            .filter(|(name, d)| {
                search.is_none_or(|s| {
                    let needle = s.to_lowercase();
                    name.to_lowercase().contains(&needle)
                        || d.description.to_lowercase().contains(&needle)
                })
            })
            .map(|(name, d)| DiscoveredTool {
                name: name.clone(),
                category: d.category.clone(),
                description: d.description.clone(),
                loaded: self.loaded.contains_key(name),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Force-load a tool and return it.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.loaded.get(name) {
            return Some(Arc::clone(&tool));
        }
        let descriptor = self.descriptors.get(name)?;
        let tool = (descriptor.factory)();
        info!(tool = name, "lazy tool loaded");
        self.loaded.insert(name.to_string(), Arc::clone(&tool));
        Some(tool)
    }

    /// Full spec; forces the load.
    pub fn get_tool_spec(&self, name: &str) -> Option<ToolSpec> {
        self.get(name).map(|t| t.spec())
    }

    /// Free a cached instance. Returns true when one was loaded.
    pub fn unload_tool(&self, name: &str) -> bool {
        let removed = self.loaded.remove(name).is_some();
        if removed {
            info!(tool = name, "lazy tool unloaded");
        }
        removed
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    pub fn stats(&self) -> LazyRegistryStats {
        let discovered = self.descriptors.len();
        let loaded = self.loaded.len();
        let memory_efficiency = if discovered == 0 {
            0.0
        } else {
            (discovered - loaded) as f64 / discovered as f64
        };
        LazyRegistryStats {
            tools_discovered: discovered,
            tools_loaded: loaded,
            memory_efficiency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolContext, ToolError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NopTool {
        name: String,
    }

    #[async_trait]
    impl Tool for NopTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                version: "1.0.0".to_string(),
                display_name: self.name.clone(),
                description: "nop".to_string(),
                category: "test".to_string(),
                capabilities: vec![],
                input_schema: json!({}),
                output_schema: json!({}),
                tags: vec![],
                owner: "copilot-os".to_string(),
                rate_limit: None,
                timeout_ms: 1000,
                max_payload_kb: 8,
                requires_auth: true,
            }
        }

        async fn invoke(&self, _payload: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(json!({}))
        }
    }

    fn registry_with(
        names: &[(&str, &str)],
        constructions: Arc<AtomicUsize>,
    ) -> LazyToolRegistry {
        let mut reg = LazyToolRegistry::new();
        for (name, category) in names {
            let name_owned = name.to_string();
            let counter = Arc::clone(&constructions);
            reg.register_factory(*name, *category, format!("{name} tool"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(NopTool {
                    name: name_owned.clone(),
                }) as Arc<dyn Tool>
            });
        }
        reg
    }

    #[test]
    fn discovery_does_not_construct() {
        let constructions = Arc::new(AtomicUsize::new(0));
        let reg = registry_with(
            &[("audit_file", "audit"), ("viz_tool", "viz")],
            Arc::clone(&constructions),
        );
        let found = reg.discover(None, None);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|t| !t.loaded));
        assert_eq!(constructions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discovery_filters() {
        let reg = registry_with(
            &[("audit_file", "audit"), ("viz_tool", "viz")],
            Arc::new(AtomicUsize::new(0)),
        );
        assert_eq!(reg.discover(Some("viz"), None).len(), 1);
        assert_eq!(reg.discover(None, Some("audit")).len(), 1);
        assert_eq!(reg.discover(Some("audit"), Some("viz")).len(), 0);
    }

    #[test]
    fn get_spec_forces_load_and_unload_frees() {
        let constructions = Arc::new(AtomicUsize::new(0));
        let reg = registry_with(&[("audit_file", "audit")], Arc::clone(&constructions));

        let spec = reg.get_tool_spec("audit_file").expect("spec");
        assert_eq!(spec.name, "audit_file");
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        assert!(reg.is_loaded("audit_file"));

        // Cached on second access.
        reg.get("audit_file").expect("tool");
        assert_eq!(constructions.load(Ordering::SeqCst), 1);

        assert!(reg.unload_tool("audit_file"));
        assert!(!reg.is_loaded("audit_file"));
        assert!(!reg.unload_tool("audit_file"));

        // Reload constructs again.
        reg.get("audit_file").expect("tool");
        assert_eq!(constructions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stats_report_memory_efficiency() {
        let reg = registry_with(
            &[("a", "x"), ("b", "x"), ("c", "x"), ("d", "x")],
            Arc::new(AtomicUsize::new(0)),
        );
        reg.get("a");
        let stats = reg.stats();
        assert_eq!(stats.tools_discovered, 4);
        assert_eq!(stats.tools_loaded, 1);
        assert!((stats.memory_efficiency - 0.75).abs() < 1e-9);
    }
}
