use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::info;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FinlensConfig {
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    pub sessions: SessionConfig,
    pub research: ResearchConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

fn default_port() -> u16 {
    7400
}
fn default_bind() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: None,
            system_prompt: None,
        }
    }
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-5-20250929".into()
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            sweep_every: default_sweep_every(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    1800
}
fn default_max_entries() -> usize {
    1000
}
fn default_sweep_every() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_max_subquestions")]
    pub max_subquestions: usize,
    #[serde(default = "default_max_followups")]
    pub max_followups: usize,
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    #[serde(default = "default_search_tool")]
    pub search_tool: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_subquestions: default_max_subquestions(),
            max_followups: default_max_followups(),
            budget_secs: default_budget_secs(),
            search_tool: default_search_tool(),
        }
    }
}

fn default_max_subquestions() -> usize {
    4
}
fn default_max_followups() -> usize {
    2
}
fn default_budget_secs() -> u64 {
    120
}
fn default_search_tool() -> String {
    "web_search".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    /// Tool name -> HTTP endpoint of the MCP-style server that serves it.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

/// Load configuration from file or use defaults.
///
/// Search order:
/// 1. `FINLENS_CONFIG` env var
/// 2. `~/.finlens/config.toml`
/// 3. Zero-config defaults (no file needed)
pub fn load() -> anyhow::Result<FinlensConfig> {
    let path = config_path();

    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let mut config: FinlensConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;

        resolve_api_key(&mut config);
        validate(&config)?;

        info!("loaded config from {}", path.display());
        Ok(config)
    } else {
        info!("no config file found, using zero-config defaults");
        let mut config = FinlensConfig::default();
        resolve_api_key(&mut config);
        Ok(config)
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FINLENS_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".finlens").join("config.toml")
}

/// Resolve API key from environment variables if not set in config.
fn resolve_api_key(config: &mut FinlensConfig) {
    if config.llm.api_key.is_none() {
        config.llm.api_key = match config.llm.provider.as_str() {
            "anthropic" => std::env::var("ANTHROPIC_API_KEY").ok(),
            "openai" => std::env::var("OPENAI_API_KEY").ok(),
            _ => None,
        };
    }
}

/// Validate the config and return clear error messages.
pub fn validate(config: &FinlensConfig) -> anyhow::Result<()> {
    let valid_providers = ["anthropic", "openai"];
    if !valid_providers.contains(&config.llm.provider.as_str()) {
        anyhow::bail!(
            "invalid provider '{}': must be one of {:?}",
            config.llm.provider,
            valid_providers
        );
    }

    if config.llm.max_tokens == 0 {
        anyhow::bail!("llm.max_tokens must be > 0");
    }

    if config.sessions.max_entries == 0 {
        anyhow::bail!("sessions.max_entries must be > 0");
    }

    if config.sessions.ttl_secs == 0 {
        anyhow::bail!("sessions.ttl_secs must be > 0");
    }

    if config.research.budget_secs == 0 {
        anyhow::bail!("research.budget_secs must be > 0");
    }

    Ok(())
}
