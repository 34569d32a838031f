//! Uniform LLM access for the faculty pipeline.
//!
//! Faculties never name a model. They call a logical *route* (`intellect`,
//! `will`, `conscience`, `summarizer`, `suggestions`) and the router resolves
//! it to a configured provider + model, applies per-route call defaults and a
//! per-route timeout, and returns the raw text. Typed helpers pair each
//! faculty call-shape with its parser from [`parse`].

pub mod parse;

pub use parse::{
    LedgerEntry, REFLECTION_DELIMITER, SALVAGED_REFLECTION, WillDecision, extract_json_object,
    parse_conscience, parse_intellect, parse_suggestions, parse_will,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use ethos_config::{AppConfig, ProviderKind, RouteConfig};

pub const ROUTE_INTELLECT: &str = "intellect";
pub const ROUTE_WILL: &str = "will";
pub const ROUTE_CONSCIENCE: &str = "conscience";
pub const ROUTE_SUMMARIZER: &str = "summarizer";
pub const ROUTE_SUGGESTIONS: &str = "suggestions";

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no route configured for '{0}'")]
    UnknownRoute(String),
    #[error("provider '{0}' is not configured or has no API key")]
    UnavailableProvider(String),
    #[error("request to '{provider}' failed: {source}")]
    Http {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{provider}' returned status {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("route '{route}' timed out after {seconds}s")]
    Timeout { route: String, seconds: u64 },
    #[error("'{provider}' response carried no text content")]
    EmptyResponse { provider: String },
}

/// Caller overrides for a single invocation; unset fields fall back to the
/// route's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOverrides {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Replaces the route's configured model. Set by [`ModelBoundProvider`]
    /// when an agent or user picked a specific model for a route.
    pub model: Option<String>,
}

/// The capability the core consumes. Implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn invoke(
        &self,
        route: &str,
        system_prompt: &str,
        user_prompt: &str,
        overrides: CallOverrides,
    ) -> Result<String, ProviderError>;

    /// Intellect call-shape: raw text split into `(answer, reflection)`.
    async fn run_intellect(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, String), ProviderError> {
        let raw = self
            .invoke(ROUTE_INTELLECT, system_prompt, user_prompt, CallOverrides::default())
            .await?;
        Ok(parse_intellect(&raw))
    }

    /// Will call-shape: raw text reduced to `(decision, reason)`.
    async fn run_will(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(WillDecision, String), ProviderError> {
        let raw = self
            .invoke(ROUTE_WILL, system_prompt, user_prompt, CallOverrides::default())
            .await?;
        Ok(parse_will(&raw))
    }

    /// Conscience call-shape: raw text parsed into a ledger.
    async fn run_conscience(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Vec<LedgerEntry>, ProviderError> {
        let raw = self
            .invoke(ROUTE_CONSCIENCE, system_prompt, user_prompt, CallOverrides::default())
            .await?;
        Ok(parse_conscience(&raw))
    }
}

struct ProviderRuntime {
    kind: ProviderKind,
    base_url: String,
    api_key: String,
}

/// Routes logical calls to configured HTTP backends.
///
/// One shared `reqwest::Client` serves every provider; per-provider state is
/// limited to credentials and the base URL. Providers whose key environment
/// variable is unset are skipped at construction and surface as
/// [`ProviderError::UnavailableProvider`] when a route names them.
pub struct LlmRouter {
    client: reqwest::Client,
    providers: HashMap<String, ProviderRuntime>,
    routes: HashMap<String, RouteConfig>,
}

impl LlmRouter {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut providers = HashMap::new();
        for (name, provider) in &config.llm.providers {
            let Some(api_key) = config.resolve_api_key(name) else {
                debug!(provider = %name, "skipping provider with no API key");
                continue;
            };
            let base_url = provider
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(provider.kind).to_string())
                .trim_end_matches('/')
                .to_string();
            providers.insert(name.clone(), ProviderRuntime { kind: provider.kind, base_url, api_key });
        }

        Self {
            client: reqwest::Client::new(),
            providers,
            routes: config.llm.routes.clone(),
        }
    }

    /// Route names that resolve to a usable provider.
    pub fn available_routes(&self) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|(_, r)| self.providers.contains_key(&r.provider))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    async fn call_openai(
        &self,
        name: &str,
        runtime: &ProviderRuntime,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let endpoint = format!("{}/chat/completions", runtime.base_url);
        let payload = json!({
            "model": model,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&runtime.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|source| ProviderError::Http { provider: name.to_string(), source })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|source| ProviderError::Http { provider: name.to_string(), source })?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                provider: name.to_string(),
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::EmptyResponse { provider: name.to_string() })
    }

    async fn call_anthropic(
        &self,
        name: &str,
        runtime: &ProviderRuntime,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let endpoint = format!("{}/v1/messages", runtime.base_url);
        let payload = json!({
            "model": model,
            "system": system_prompt,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "user", "content": user_prompt},
            ],
        });

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &runtime.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|source| ProviderError::Http { provider: name.to_string(), source })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|source| ProviderError::Http { provider: name.to_string(), source })?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                provider: name.to_string(),
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        body.get("content")
            .and_then(|c| c.get(0))
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::EmptyResponse { provider: name.to_string() })
    }
}

fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => OPENAI_DEFAULT_BASE,
        ProviderKind::Anthropic => ANTHROPIC_DEFAULT_BASE,
    }
}

/// Decorator pinning specific models onto routes for one orchestrator
/// instance.
///
/// The effective model for a route is: caller override, then the binding
/// here (agent or user choice), then the route's configured default.
pub struct ModelBoundProvider {
    inner: Arc<dyn LlmProvider>,
    models: HashMap<String, String>,
}

impl ModelBoundProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, models: HashMap<String, String>) -> Self {
        Self { inner, models }
    }
}

#[async_trait]
impl LlmProvider for ModelBoundProvider {
    async fn invoke(
        &self,
        route: &str,
        system_prompt: &str,
        user_prompt: &str,
        mut overrides: CallOverrides,
    ) -> Result<String, ProviderError> {
        if overrides.model.is_none() {
            overrides.model = self.models.get(route).cloned();
        }
        self.inner.invoke(route, system_prompt, user_prompt, overrides).await
    }
}

#[async_trait]
impl LlmProvider for LlmRouter {
    async fn invoke(
        &self,
        route_name: &str,
        system_prompt: &str,
        user_prompt: &str,
        overrides: CallOverrides,
    ) -> Result<String, ProviderError> {
        let route = self
            .routes
            .get(route_name)
            .ok_or_else(|| ProviderError::UnknownRoute(route_name.to_string()))?;
        let runtime = self
            .providers
            .get(&route.provider)
            .ok_or_else(|| ProviderError::UnavailableProvider(route.provider.clone()))?;

        let temperature = overrides.temperature.unwrap_or(route.temperature);
        let max_tokens = overrides.max_tokens.unwrap_or(route.max_tokens);
        let model = overrides.model.as_deref().unwrap_or(&route.model);

        let call = async {
            match runtime.kind {
                ProviderKind::Openai => {
                    self.call_openai(
                        &route.provider,
                        runtime,
                        model,
                        system_prompt,
                        user_prompt,
                        temperature,
                        max_tokens,
                    )
                    .await
                }
                ProviderKind::Anthropic => {
                    self.call_anthropic(
                        &route.provider,
                        runtime,
                        model,
                        system_prompt,
                        user_prompt,
                        temperature,
                        max_tokens,
                    )
                    .await
                }
            }
        };

        match tokio::time::timeout(Duration::from_secs(route.timeout_secs), call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                route: route_name.to_string(),
                seconds: route.timeout_secs,
            }),
        }
    }
}
