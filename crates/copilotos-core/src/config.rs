use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Fixed-window per-user request budget enforced by the gateway middleware.
pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 1000;

/// Top-level config (copilotos.toml + COPILOTOS_* env overrides).
///
/// Immutable after startup — the loaded value is owned by the application
/// state and shared by reference, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub saptiva: SaptivaConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub research: ResearchConfig,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            saptiva: SaptivaConfig::default(),
            prompts: PromptsConfig::default(),
            database: DatabaseConfig::default(),
            mcp: McpConfig::default(),
            research: ResearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Trusted Host header values. Empty disables the check.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_hour: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            cors_origins: Vec::new(),
            allowed_hosts: Vec::new(),
            rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Signing key for access/refresh/reset tokens.
    #[serde(default = "default_secret")]
    pub jwt_secret_key: String,
    /// General application secret. Must be at least 32 characters.
    #[serde(default = "default_secret")]
    pub secret_key: String,
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_key: default_secret(),
            secret_key: default_secret(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
        }
    }
}

/// Upstream Saptiva completion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaptivaConfig {
    #[serde(default = "default_saptiva_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    /// Read timeout — generous because it bounds streaming reads.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: f64,
    /// Total timeout for non-streaming completions.
    #[serde(default = "default_total_timeout")]
    pub timeout_secs: u64,
    /// Serve canned responses instead of calling the API.
    #[serde(default)]
    pub force_mock: bool,
    /// Fall back to the mock when the API is unreachable.
    #[serde(default)]
    pub allow_mock_fallback: bool,
}

impl Default for SaptivaConfig {
    fn default() -> Self {
        Self {
            base_url: default_saptiva_base_url(),
            api_key: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            timeout_secs: default_total_timeout(),
            force_mock: false,
            allow_mock_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Path to the YAML prompt registry.
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
    #[serde(default = "bool_true")]
    pub enable_model_system_prompt: bool,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            enable_model_system_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Usernames/emails granted the mcp:admin.* scope family.
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default = "default_task_ttl")]
    pub task_ttl_hours: u64,
    #[serde(default = "default_max_payload_kb")]
    pub max_payload_kb: usize,
    #[serde(default = "default_calls_per_minute")]
    pub calls_per_minute: u32,
    #[serde(default = "default_calls_per_hour")]
    pub calls_per_hour: u32,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            admin_users: Vec::new(),
            task_ttl_hours: default_task_ttl(),
            max_payload_kb: default_max_payload_kb(),
            calls_per_minute: default_calls_per_minute(),
            calls_per_hour: default_calls_per_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// While true every research endpoint answers 410 GONE.
    #[serde(default = "bool_true")]
    pub kill_switch: bool,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self { kill_switch: true }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_rate_limit() -> u32 {
    DEFAULT_RATE_LIMIT_PER_HOUR
}
fn default_secret() -> String {
    "change-me-change-me-change-me-change-me".to_string()
}
fn default_access_ttl() -> u64 {
    1800
}
fn default_refresh_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_saptiva_base_url() -> String {
    "https://api.saptiva.com".to_string()
}
fn default_connect_timeout() -> f64 {
    10.0
}
fn default_read_timeout() -> f64 {
    120.0
}
fn default_total_timeout() -> u64 {
    30
}
fn default_registry_path() -> String {
    "prompts/registry.yaml".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.copilotos/copilotos.db", home)
}
fn default_task_ttl() -> u64 {
    24
}
fn default_max_payload_kb() -> usize {
    1024
}
fn default_calls_per_minute() -> u32 {
    60
}
fn default_calls_per_hour() -> u32 {
    600
}
fn bool_true() -> bool {
    true
}

impl CopilotConfig {
    /// Load config from a TOML file with COPILOTOS_* env var overrides,
    /// then apply the flat environment names recognized by deployments
    /// (SAPTIVA_*, JWT_SECRET_KEY, CORS_ORIGINS, ...).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: CopilotConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COPILOTOS_").split("__"))
            .extract()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Flat env names take precedence over both the file and the
    /// COPILOTOS_* namespace.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SAPTIVA_BASE_URL") {
            self.saptiva.base_url = v;
        }
        if let Ok(v) = std::env::var("SAPTIVA_API_KEY") {
            self.saptiva.api_key = v;
        }
        if let Ok(v) = std::env::var("SAPTIVA_CONNECT_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.saptiva.connect_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SAPTIVA_READ_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.saptiva.read_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SAPTIVA_FORCE_MOCK") {
            self.saptiva.force_mock = env_flag(&v);
        }
        if let Ok(v) = std::env::var("SAPTIVA_ALLOW_MOCK_FALLBACK") {
            self.saptiva.allow_mock_fallback = env_flag(&v);
        }
        if let Ok(v) = std::env::var("JWT_SECRET_KEY") {
            self.auth.jwt_secret_key = v;
        }
        if let Ok(v) = std::env::var("SECRET_KEY") {
            self.auth.secret_key = v;
        }
        if let Ok(v) = std::env::var("CORS_ORIGINS") {
            self.gateway.cors_origins = parse_list(&v);
        }
        if let Ok(v) = std::env::var("ALLOWED_HOSTS") {
            self.gateway.allowed_hosts = parse_list(&v);
        }
        if let Ok(v) = std::env::var("PROMPT_REGISTRY_PATH") {
            self.prompts.registry_path = v;
        }
        if let Ok(v) = std::env::var("ENABLE_MODEL_SYSTEM_PROMPT") {
            self.prompts.enable_model_system_prompt = env_flag(&v);
        }
        if let Ok(v) = std::env::var("DEEP_RESEARCH_KILL_SWITCH") {
            self.research.kill_switch = env_flag(&v);
        }
        if let Ok(v) = std::env::var("MCP_ADMIN_USERS") {
            self.mcp.admin_users = parse_list(&v);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            self.database.path = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.auth.secret_key.len() < 32 {
            return Err(ApiError::Config(
                "SECRET_KEY must be at least 32 characters".to_string(),
            ));
        }
        if self.saptiva.base_url.is_empty() {
            return Err(ApiError::Config("saptiva.base_url must be set".to_string()));
        }
        Ok(())
    }
}

/// Parse a list value given either as CSV or as a JSON array.
fn parse_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items;
        }
    }
    trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.copilotos/copilotos.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_accepts_csv() {
        assert_eq!(
            parse_list("http://a.example, http://b.example"),
            vec!["http://a.example", "http://b.example"]
        );
    }

    #[test]
    fn parse_list_accepts_json() {
        assert_eq!(
            parse_list(r#"["http://a.example","http://b.example"]"#),
            vec!["http://a.example", "http://b.example"]
        );
    }

    #[test]
    fn env_flag_variants() {
        assert!(env_flag("true"));
        assert!(env_flag("1"));
        assert!(env_flag("YES"));
        assert!(!env_flag("false"));
        assert!(!env_flag("0"));
    }

    #[test]
    fn default_config_validates() {
        let config = CopilotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mcp.max_payload_kb, 1024);
        assert_eq!(config.gateway.rate_limit_per_hour, 1000);
        assert!(config.research.kill_switch);
    }

    #[test]
    fn short_secret_rejected() {
        let mut config = CopilotConfig::default();
        config.auth.secret_key = "short".to_string();
        assert!(config.validate().is_err());
    }
}
