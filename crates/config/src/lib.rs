use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Options that shape a single governed turn and the state around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// EMA smoothing factor for the spirit memory vector. High values mean
    /// long memory (slow change), low values mean fast change.
    pub spirit_beta: f64,
    /// Weight mass reserved for organizational governance values when a
    /// policy is merged into an agent. Organizations may override this.
    pub governance_weight: f64,
    /// Idle lifetime of cached orchestrator instances, in seconds.
    pub instance_cache_ttl_secs: u64,
    /// Hard per-user per-day prompt cap. 0 disables the check.
    pub daily_prompt_limit: u32,
    /// When true, the summarizer task also rewrites the long-term user
    /// profile JSON from the latest exchange.
    pub enable_profile_extraction: bool,
    /// Agent served to users who have not picked one.
    pub default_agent_key: String,
    /// Capacity of the background audit queue. Submissions beyond this are
    /// dropped and logged, never retried.
    pub audit_queue_capacity: usize,
    /// How many recent mu samples each instance retains for trend detection
    /// in the spirit feedback seed. Process-local, never persisted.
    pub mu_history_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            spirit_beta: 0.9,
            governance_weight: 0.40,
            instance_cache_ttl_secs: 600,
            daily_prompt_limit: 0,
            enable_profile_extraction: false,
            default_agent_key: "steward".to_string(),
            audit_queue_capacity: 64,
            mu_history_window: 12,
        }
    }
}

/// The wire shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-style `/chat/completions` with a system message in the list.
    Openai,
    /// Anthropic-style `/v1/messages` with a top-level `system` field.
    Anthropic,
}

/// One configured LLM backend. API keys are resolved through the named
/// environment variable and never stored in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Binds a logical route (intellect, will, ...) to a provider + model with
/// per-route call defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl RouteConfig {
    fn new(
        provider: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
        timeout_secs: u64,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
            timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub routes: HashMap<String, RouteConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                kind: ProviderKind::Openai,
                api_key_env: "OPENAI_API_KEY".to_string(),
                base_url: None,
            },
        );
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                kind: ProviderKind::Anthropic,
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                base_url: None,
            },
        );

        let mut routes = HashMap::new();
        routes.insert("intellect".to_string(), RouteConfig::new("openai", "gpt-4o", 1.0, 4096, 60));
        routes.insert("will".to_string(), RouteConfig::new("openai", "gpt-4o-mini", 0.0, 1024, 20));
        routes.insert("conscience".to_string(), RouteConfig::new("openai", "gpt-4o", 0.1, 4096, 60));
        routes.insert(
            "summarizer".to_string(),
            RouteConfig::new("openai", "gpt-4o-mini", 0.0, 1024, 30),
        );
        routes.insert(
            "suggestions".to_string(),
            RouteConfig::new("openai", "gpt-4o-mini", 0.7, 512, 10),
        );

        Self { providers, routes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Directory receiving the per-agent per-day turn ledgers.
    pub turn_log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            turn_log_dir: "./turn_logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve the API key for a named provider from its configured
    /// environment variable. Returns `None` when the variable is unset or
    /// empty, which callers treat as "provider disabled".
    pub fn resolve_api_key(&self, provider: &str) -> Option<String> {
        let cfg = self.llm.providers.get(provider)?;
        let value = env::var(&cfg.api_key_env).ok()?;
        if value.trim().is_empty() { None } else { Some(value) }
    }
}

/// Load `.env` (if present) and install the global tracing subscriber using
/// the configured level as the default filter.
pub fn init_telemetry(config: &TelemetryConfig) {
    let _ = dotenvy::dotenv();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_all_five_routes() {
        let config = AppConfig::default();
        for route in ["intellect", "will", "conscience", "summarizer", "suggestions"] {
            assert!(config.llm.routes.contains_key(route), "missing route {route}");
        }
    }

    #[test]
    fn will_route_defaults_are_strict() {
        let config = AppConfig::default();
        let will = &config.llm.routes["will"];
        assert_eq!(will.temperature, 0.0);
        assert_eq!(will.timeout_secs, 20);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let config = AppConfig::load_from("/definitely/not/a/real/path.toml").unwrap();
        assert_eq!(config.orchestrator.spirit_beta, 0.9);
        assert_eq!(config.orchestrator.governance_weight, 0.40);
        assert_eq!(config.orchestrator.instance_cache_ttl_secs, 600);
    }

    #[test]
    fn toml_round_trip_preserves_routes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ethos.toml");

        let mut config = AppConfig::default();
        config.orchestrator.daily_prompt_limit = 50;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.orchestrator.daily_prompt_limit, 50);
        assert_eq!(loaded.llm.routes.len(), config.llm.routes.len());
        assert_eq!(loaded.llm.routes["suggestions"].max_tokens, 512);
    }
}
