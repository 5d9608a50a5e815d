use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use semver::{Version, VersionReq};
use tracing::info;

use crate::spec::ToolSpec;
use crate::tool::Tool;

/// Resolution failure, carrying whatever versions do exist so callers can
/// report them.
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub tool: String,
    pub requested: Option<String>,
    pub available_versions: Vec<String>,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.requested {
            Some(v) => write!(f, "tool '{}' has no version matching '{}'", self.tool, v),
            None => write!(f, "tool '{}' is not registered", self.tool),
        }
    }
}

impl std::error::Error for ResolveError {}

/// In-memory registry of MCP tools, versioned per name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, BTreeMap<Version, Arc<dyn Tool>>>,
    latest: HashMap<String, Version>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under the name/version from its spec. A malformed
    /// version string rejects the registration.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), semver::Error> {
        let spec = tool.spec();
        let version = Version::parse(&spec.version)?;

        let versions = self.tools.entry(spec.name.clone()).or_default();
        versions.insert(version.clone(), tool);

        let newest = versions.keys().next_back().cloned().unwrap_or(version);
        self.latest.insert(spec.name.clone(), newest);

        info!(
            tool = %spec.name,
            version = %spec.version,
            category = %spec.category,
            "registered MCP tool"
        );
        Ok(())
    }

    pub fn unregister(&mut self, name: &str, version: Option<&str>) {
        match version.and_then(|v| Version::parse(v).ok()) {
            None => {
                self.tools.remove(name);
                self.latest.remove(name);
            }
            Some(version) => {
                if let Some(versions) = self.tools.get_mut(name) {
                    versions.remove(&version);
                    match versions.keys().next_back().cloned() {
                        Some(newest) => {
                            self.latest.insert(name.to_string(), newest);
                        }
                        None => {
                            self.tools.remove(name);
                            self.latest.remove(name);
                        }
                    }
                }
            }
        }
    }

    /// All specs, sorted by (name, version), for discovery.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .flat_map(|versions| versions.values().map(|t| t.spec()))
            .collect();
        specs.sort_by(|a, b| (a.name.as_str(), a.version.as_str()).cmp(&(b.name.as_str(), b.version.as_str())));
        specs
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn available_versions(&self, name: &str) -> Vec<String> {
        self.tools
            .get(name)
            .map(|versions| versions.keys().map(|v| v.to_string()).collect())
            .unwrap_or_default()
    }

    /// Resolve a tool by name and optional version constraint.
    ///
    /// - `None` or `"latest"` → the highest registered version.
    /// - An exact version (`"2.0.0"`) → that version, which must exist.
    /// - A range constraint (`"^1.2.0"`, `"~1.2"`) → the highest version
    ///   satisfying it.
    pub fn resolve(
        &self,
        name: &str,
        constraint: Option<&str>,
    ) -> Result<(Arc<dyn Tool>, Version), ResolveError> {
        let versions = self.tools.get(name).ok_or_else(|| ResolveError {
            tool: name.to_string(),
            requested: constraint.map(String::from),
            available_versions: Vec::new(),
        })?;

        let not_found = |requested: Option<&str>| ResolveError {
            tool: name.to_string(),
            requested: requested.map(String::from),
            available_versions: versions.keys().map(|v| v.to_string()).collect(),
        };

        let resolved = match constraint {
            None | Some("latest") => self
                .latest
                .get(name)
                .and_then(|v| versions.get_key_value(v)),
            Some(raw) => {
                if let Ok(exact) = Version::parse(raw) {
                    // A bare version is an exact requirement, not a caret range.
                    versions.get_key_value(&exact)
                } else if let Ok(req) = VersionReq::parse(raw) {
                    versions
                        .iter()
                        .filter(|(v, _)| req.matches(v))
                        .next_back()
                } else {
                    return Err(not_found(Some(raw)));
                }
            }
        };

        match resolved {
            Some((version, tool)) => Ok((Arc::clone(tool), version.clone())),
            None => Err(not_found(constraint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolContext, ToolError};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FakeTool {
        name: &'static str,
        version: &'static str,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.to_string(),
                version: self.version.to_string(),
                display_name: self.name.to_string(),
                description: String::new(),
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
            Ok(json!({"version": self.version}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FakeTool { name: "tool_x", version: "1.0.0" }))
            .expect("register");
        reg.register(Arc::new(FakeTool { name: "tool_x", version: "1.2.0" }))
            .expect("register");
        reg.register(Arc::new(FakeTool { name: "tool_y", version: "2.1.3" }))
            .expect("register");
        reg
    }

    #[test]
    fn latest_is_default() {
        let reg = registry();
        let (_, version) = reg.resolve("tool_x", None).expect("resolve");
        assert_eq!(version.to_string(), "1.2.0");
        let (_, version) = reg.resolve("tool_x", Some("latest")).expect("resolve");
        assert_eq!(version.to_string(), "1.2.0");
    }

    #[test]
    fn caret_selects_highest_compatible() {
        let reg = registry();
        let (_, version) = reg.resolve("tool_x", Some("^1.0.0")).expect("resolve");
        assert_eq!(version.to_string(), "1.2.0");
    }

    #[test]
    fn tilde_constrains_minor() {
        let reg = registry();
        let (_, version) = reg.resolve("tool_x", Some("~1.0")).expect("resolve");
        assert_eq!(version.to_string(), "1.0.0");
    }

    #[test]
    fn exact_version_must_exist() {
        let reg = registry();
        let err = reg.resolve("tool_x", Some("2.0.0")).unwrap_err();
        assert_eq!(err.available_versions, vec!["1.0.0", "1.2.0"]);

        let (_, version) = reg.resolve("tool_x", Some("1.0.0")).expect("resolve");
        assert_eq!(version.to_string(), "1.0.0");
    }

    #[test]
    fn unknown_tool_has_empty_versions() {
        let reg = registry();
        let err = reg.resolve("nope", None).unwrap_err();
        assert!(err.available_versions.is_empty());
    }

    #[test]
    fn unregister_version_updates_latest() {
        let mut reg = registry();
        reg.unregister("tool_x", Some("1.2.0"));
        let (_, version) = reg.resolve("tool_x", None).expect("resolve");
        assert_eq!(version.to_string(), "1.0.0");

        reg.unregister("tool_x", None);
        assert!(reg.resolve("tool_x", None).is_err());
    }

    #[test]
    fn list_specs_sorted() {
        let reg = registry();
        let specs = reg.list_specs();
        let pairs: Vec<(String, String)> =
            specs.iter().map(|s| (s.name.clone(), s.version.clone())).collect();
        assert_eq!(
            pairs,
            vec![
                ("tool_x".to_string(), "1.0.0".to_string()),
                ("tool_x".to_string(), "1.2.0".to_string()),
                ("tool_y".to_string(), "2.1.3".to_string()),
            ]
        );
    }
}
