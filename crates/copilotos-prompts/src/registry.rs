use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use copilotos_core::types::Channel;

use crate::error::{PromptError, Result};

/// Output token budget per channel. Unknown channels are parsed to
/// [`Channel::Chat`] upstream, so the chat budget is the effective default.
pub fn channel_max_tokens(channel: Channel) -> u32 {
    match channel {
        Channel::Chat => 1200,
        Channel::Report => 3500,
        Channel::Title => 64,
        Channel::Summary => 256,
        Channel::Code => 2048,
    }
}

const ADDENDUM_SEPARATOR: &str = "\n\n---\n**Instrucciones específicas del modelo:**\n";
const TOOLS_BLOCK: &str = "Herramientas disponibles\n{TOOLS}";
const NO_TOOLS_SENTENCE: &str = "No hay herramientas externas disponibles en este momento.";

/// Generation parameters for one model entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f64,
    /// Overwritten per channel at resolution time.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            presence_penalty: 0.0,
            frequency_penalty: default_frequency_penalty(),
            max_tokens: None,
        }
    }
}

fn default_temperature() -> f64 {
    0.3
}
fn default_top_p() -> f64 {
    0.9
}
fn default_frequency_penalty() -> f64 {
    0.2
}

impl ModelParams {
    /// Range checks mirror the upstream API contract.
    fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!("temperature out of range: {}", self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("top_p out of range: {}", self.top_p));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(format!(
                "presence_penalty out of range: {}",
                self.presence_penalty
            ));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(format!(
                "frequency_penalty out of range: {}",
                self.frequency_penalty
            ));
        }
        if let Some(max) = self.max_tokens {
            if max < 1 {
                return Err("max_tokens must be at least 1".to_string());
            }
        }
        Ok(())
    }
}

/// Prompt entry for a single model.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptEntry {
    /// System prompt with `{CopilotOS}`, `{Saptiva}` and `{TOOLS}` placeholders.
    pub system_base: String,
    pub addendum: Option<String>,
    #[serde(default)]
    pub params: ModelParams,
}

/// Resolution metadata attached to every resolved prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptMetadata {
    pub model: String,
    pub channel: Channel,
    pub prompt_version: String,
    /// First 16 hex chars of SHA-256 over the resolved system text.
    pub system_hash: String,
    pub has_addendum: bool,
    pub has_tools: bool,
}

/// Fully resolved generation parameters for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedParams {
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub max_tokens: u32,
    pub metadata: PromptMetadata,
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "default_copilot_name")]
    copilot_name: String,
    #[serde(default = "default_org_name")]
    org_name: String,
    #[serde(default)]
    models: HashMap<String, serde_yaml::Value>,
}

fn default_version() -> String {
    "v1".to_string()
}
fn default_copilot_name() -> String {
    "CopilotOS".to_string()
}
fn default_org_name() -> String {
    "Saptiva".to_string()
}

/// Centralized registry of per-model system prompts and parameters.
#[derive(Debug, Clone)]
pub struct PromptRegistry {
    pub version: String,
    pub copilot_name: String,
    pub org_name: String,
    models: HashMap<String, PromptEntry>,
}

impl PromptRegistry {
    /// Load and validate a registry from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PromptError::InvalidConfig(format!("prompt registry not found: {}: {e}", path.display()))
        })?;
        let registry = Self::parse(&content)?;
        info!(
            path = %path.display(),
            version = %registry.version,
            models = registry.models.len(),
            "prompt registry loaded"
        );
        Ok(registry)
    }

    /// Parse registry YAML. Entries missing `system_base` or carrying
    /// out-of-range params are skipped with a warning; an empty result is
    /// an error.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(PromptError::InvalidConfig(
                "empty prompt registry file".to_string(),
            ));
        }

        let raw: RawRegistry = serde_yaml::from_str(content)
            .map_err(|e| PromptError::InvalidConfig(format!("invalid YAML: {e}")))?;

        if raw.models.is_empty() {
            return Err(PromptError::InvalidConfig(
                "no models defined in registry".to_string(),
            ));
        }

        let mut models = HashMap::new();
        for (name, value) in raw.models {
            let entry: PromptEntry = match serde_yaml::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(model = %name, error = %e, "model entry missing system_base or malformed, skipping");
                    continue;
                }
            };
            if let Err(reason) = entry.params.validate() {
                warn!(model = %name, %reason, "model params out of range, skipping");
                continue;
            }
            debug!(
                model = %name,
                has_addendum = entry.addendum.is_some(),
                "loaded prompt entry"
            );
            models.insert(name, entry);
        }

        if models.is_empty() {
            return Err(PromptError::InvalidConfig(
                "no valid models loaded from registry".to_string(),
            ));
        }

        Ok(Self {
            version: raw.version,
            copilot_name: raw.copilot_name,
            org_name: raw.org_name,
            models,
        })
    }

    /// Resolve the system prompt and generation params for a model/channel.
    ///
    /// Unknown models fall back to the `default` entry. The channel budget
    /// always overwrites the entry's `max_tokens`.
    pub fn resolve(
        &self,
        model: &str,
        tools_markdown: Option<&str>,
        channel: Channel,
    ) -> Result<(String, ResolvedParams)> {
        let entry = match self.models.get(model) {
            Some(entry) => entry,
            None => {
                warn!(
                    model,
                    available = ?self.available_models(),
                    "model not found in registry, using default"
                );
                self.models
                    .get("default")
                    .ok_or_else(|| PromptError::ModelNotConfigured {
                        model: model.to_string(),
                    })?
            }
        };

        let mut system_text = entry
            .system_base
            .replace("{CopilotOS}", &self.copilot_name)
            .replace("{Saptiva}", &self.org_name);

        match tools_markdown {
            Some(md) => {
                system_text = system_text.replace("{TOOLS}", md);
            }
            None => {
                // Remove the whole tools section; strip any stray placeholder
                // left by prompts that use a different surrounding format.
                system_text = system_text
                    .replace(TOOLS_BLOCK, NO_TOOLS_SENTENCE)
                    .replace("{TOOLS}", "");
            }
        }

        if let Some(addendum) = &entry.addendum {
            system_text = format!("{system_text}{ADDENDUM_SEPARATOR}{addendum}");
        }

        let system_hash = hash_system_prompt(&system_text);
        let params = ResolvedParams {
            temperature: entry.params.temperature,
            top_p: entry.params.top_p,
            presence_penalty: entry.params.presence_penalty,
            frequency_penalty: entry.params.frequency_penalty,
            max_tokens: channel_max_tokens(channel),
            metadata: PromptMetadata {
                model: model.to_string(),
                channel,
                prompt_version: self.version.clone(),
                system_hash: system_hash.clone(),
                has_addendum: entry.addendum.is_some(),
                has_tools: tools_markdown.is_some(),
            },
        };

        debug!(
            model,
            channel = %channel,
            system_hash = %system_hash,
            prompt_length = system_text.len(),
            max_tokens = params.max_tokens,
            "resolved prompt"
        );

        Ok((system_text, params))
    }

    pub fn available_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    /// A registry is valid only when a `default` entry exists.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(PromptError::InvalidConfig(
                "no models loaded in registry".to_string(),
            ));
        }
        if !self.models.contains_key("default") {
            return Err(PromptError::InvalidConfig(
                "registry must have a 'default' model entry".to_string(),
            ));
        }
        for (name, entry) in &self.models {
            if !entry.system_base.contains("{CopilotOS}") && !entry.system_base.contains("{Saptiva}")
            {
                warn!(model = %name, "model prompt missing organization placeholders");
            }
        }
        Ok(())
    }
}

/// SHA-256 fingerprint of a resolved system prompt, truncated to 16 hex
/// chars for telemetry and cache discrimination.
fn hash_system_prompt(system_text: &str) -> String {
    let digest = Sha256::digest(system_text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY_YAML: &str = r#"
version: "v2"
copilot_name: "CopilotOS"
org_name: "Saptiva"
models:
  "Saptiva Cortex":
    system_base: |
      Eres {CopilotOS}, el asistente de {Saptiva}.
      Herramientas disponibles
      {TOOLS}
    addendum: "Responde siempre en español."
    params:
      temperature: 0.4
      top_p: 0.95
  "Saptiva Turbo":
    system_base: "Eres {CopilotOS}. Herramientas disponibles\n{TOOLS}"
  default:
    system_base: "Eres {CopilotOS}, asistente de {Saptiva}. {TOOLS}"
"#;

    fn registry() -> PromptRegistry {
        PromptRegistry::parse(REGISTRY_YAML).expect("parse")
    }

    #[test]
    fn resolve_substitutes_names_and_tools() {
        let reg = registry();
        let (text, params) = reg
            .resolve("Saptiva Cortex", Some("- audit_file: audita documentos"), Channel::Chat)
            .expect("resolve");
        assert!(text.contains("Eres CopilotOS, el asistente de Saptiva."));
        assert!(text.contains("- audit_file: audita documentos"));
        assert!(!text.contains("{TOOLS}"));
        assert!(params.metadata.has_tools);
        assert!(params.metadata.has_addendum);
    }

    #[test]
    fn resolve_without_tools_inserts_spanish_sentence() {
        let reg = registry();
        let (text, params) = reg
            .resolve("Saptiva Turbo", None, Channel::Chat)
            .expect("resolve");
        assert!(text.contains(NO_TOOLS_SENTENCE));
        assert!(!text.contains("{TOOLS}"));
        assert!(!params.metadata.has_tools);
    }

    #[test]
    fn addendum_appended_after_separator() {
        let reg = registry();
        let (text, _) = reg
            .resolve("Saptiva Cortex", None, Channel::Chat)
            .expect("resolve");
        let sep_pos = text
            .find("**Instrucciones específicas del modelo:**")
            .expect("separator present");
        let add_pos = text.find("Responde siempre en español.").expect("addendum");
        assert!(sep_pos < add_pos);
    }

    #[test]
    fn channel_budgets() {
        let reg = registry();
        for (channel, budget) in [
            (Channel::Chat, 1200),
            (Channel::Report, 3500),
            (Channel::Title, 64),
            (Channel::Summary, 256),
            (Channel::Code, 2048),
        ] {
            let (_, params) = reg.resolve("default", None, channel).expect("resolve");
            assert_eq!(params.max_tokens, budget);
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let reg = registry();
        let (text_a, params_a) = reg
            .resolve("Saptiva Cortex", Some("tools"), Channel::Chat)
            .expect("resolve");
        let (text_b, params_b) = reg
            .resolve("Saptiva Cortex", Some("tools"), Channel::Chat)
            .expect("resolve");
        assert_eq!(text_a, text_b);
        assert_eq!(params_a.metadata.system_hash, params_b.metadata.system_hash);
        assert_eq!(params_a.metadata.system_hash.len(), 16);
    }

    #[test]
    fn hash_discriminates_model_and_tools() {
        let reg = registry();
        let (_, cortex) = reg
            .resolve("Saptiva Cortex", Some("tools"), Channel::Chat)
            .expect("resolve");
        let (_, turbo) = reg
            .resolve("Saptiva Turbo", Some("tools"), Channel::Chat)
            .expect("resolve");
        let (_, cortex_other_tools) = reg
            .resolve("Saptiva Cortex", Some("other tools"), Channel::Chat)
            .expect("resolve");
        assert_ne!(cortex.metadata.system_hash, turbo.metadata.system_hash);
        assert_ne!(
            cortex.metadata.system_hash,
            cortex_other_tools.metadata.system_hash
        );
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let reg = registry();
        let (text, _) = reg
            .resolve("Modelo Inexistente", None, Channel::Chat)
            .expect("resolve");
        assert!(text.starts_with("Eres CopilotOS, asistente de Saptiva."));
    }

    #[test]
    fn unknown_model_without_default_fails() {
        let yaml = r#"
models:
  "solo":
    system_base: "hola {CopilotOS}"
"#;
        let reg = PromptRegistry::parse(yaml).expect("parse");
        let err = reg.resolve("otro", None, Channel::Chat).unwrap_err();
        assert!(matches!(err, PromptError::ModelNotConfigured { .. }));
    }

    #[test]
    fn validate_requires_default() {
        let yaml = r#"
models:
  "solo":
    system_base: "hola {CopilotOS}"
"#;
        let reg = PromptRegistry::parse(yaml).expect("parse");
        assert!(reg.validate().is_err());
        assert!(registry().validate().is_ok());
    }

    #[test]
    fn entries_without_system_base_are_skipped() {
        let yaml = r#"
models:
  "broken":
    addendum: "sin prompt"
  default:
    system_base: "hola {CopilotOS}"
"#;
        let reg = PromptRegistry::parse(yaml).expect("parse");
        assert_eq!(reg.available_models(), vec!["default".to_string()]);
    }

    #[test]
    fn out_of_range_params_are_skipped() {
        let yaml = r#"
models:
  "hot":
    system_base: "hola"
    params:
      temperature: 3.5
  default:
    system_base: "hola {CopilotOS}"
"#;
        let reg = PromptRegistry::parse(yaml).expect("parse");
        assert_eq!(reg.available_models(), vec!["default".to_string()]);
    }

    #[test]
    fn empty_file_rejected() {
        assert!(PromptRegistry::parse("   ").is_err());
        assert!(PromptRegistry::parse("version: v1\nmodels: {}\n").is_err());
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, REGISTRY_YAML).expect("write");
        let reg = PromptRegistry::load(&path).expect("load");
        assert_eq!(reg.version, "v2");
    }
}
