use serde::{Deserialize, Serialize};

/// Rate limit advertised by a tool, overriding the subsystem defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub calls_per_minute: u32,
    pub calls_per_hour: u32,
}

/// Publicly discoverable metadata of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Semver version string (e.g. "1.2.0").
    pub version: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_payload_kb")]
    pub max_payload_kb: usize,
    #[serde(default = "default_requires_auth")]
    pub requires_auth: bool,
}

fn default_owner() -> String {
    "copilot-os".to_string()
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_max_payload_kb() -> usize {
    64
}
fn default_requires_auth() -> bool {
    true
}

impl ToolSpec {
    /// Generate an example payload from the input schema's properties.
    /// Used by the schema endpoint so clients can see a valid shape.
    pub fn example_payload(&self) -> serde_json::Value {
        example_from_schema(&self.input_schema)
    }
}

fn example_from_schema(schema: &serde_json::Value) -> serde_json::Value {
    use serde_json::{json, Map, Value};

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return json!({});
    };

    let mut example = Map::new();
    for (name, prop) in properties {
        let value = match prop.get("type").and_then(|t| t.as_str()) {
            Some("string") => prop
                .get("default")
                .cloned()
                .unwrap_or_else(|| json!(format!("example-{name}"))),
            Some("integer") | Some("number") => prop.get("default").cloned().unwrap_or(json!(1)),
            Some("boolean") => prop.get("default").cloned().unwrap_or(json!(true)),
            Some("array") => json!([]),
            Some("object") => prop
                .get("properties")
                .map(|_| example_from_schema(prop))
                .unwrap_or(json!({})),
            _ => Value::Null,
        };
        example.insert(name.clone(), value);
    }
    Value::Object(example)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn example_payload_covers_property_types() {
        let spec = ToolSpec {
            name: "t".to_string(),
            version: "1.0.0".to_string(),
            display_name: "T".to_string(),
            description: String::new(),
            category: "test".to_string(),
            capabilities: vec![],
            input_schema: json!({
                "type": "object",
                "properties": {
                    "doc_id": {"type": "string"},
                    "limit": {"type": "integer", "default": 500},
                    "enabled": {"type": "boolean"},
                    "ops": {"type": "array"}
                }
            }),
            output_schema: json!({}),
            tags: vec![],
            owner: "copilot-os".to_string(),
            rate_limit: None,
            timeout_ms: 1000,
            max_payload_kb: 8,
            requires_auth: true,
        };

        let example = spec.example_payload();
        assert_eq!(example["doc_id"], "example-doc_id");
        assert_eq!(example["limit"], 500);
        assert_eq!(example["enabled"], true);
        assert_eq!(example["ops"], json!([]));
    }
}
