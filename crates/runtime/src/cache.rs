//! The orchestrator instance cache.
//!
//! Compiled instances are expensive (persona compilation, will cache, mu
//! history), so they are cached by everything that shapes their behavior:
//! agent, model triple, policy, and the organization settings hash. Keys
//! keep the normalized agent slug as a parsable prefix so invalidation by
//! agent is a plain prefix delete, independent of the hash suffix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use ethos_agent::{GovernancePolicy, OrgSettings, agent_slug, compile, registry};
use ethos_audit::TurnLedger;
use ethos_config::AppConfig;
use ethos_faculties::ContextProvider;
use ethos_llm::{LlmProvider, ModelBoundProvider, ROUTE_CONSCIENCE, ROUTE_INTELLECT, ROUTE_WILL};
use ethos_memory::Persistence;

use crate::audit::AuditHandle;
use crate::error::TurnError;
use crate::orchestrator::{Orchestrator, OrchestratorOptions};

/// Identity of one cacheable instance: the effective model triple plus the
/// optional governance policy.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub agent_name: String,
    pub intellect_model: String,
    pub will_model: String,
    pub conscience_model: String,
    pub policy_id: Option<String>,
}

/// Shared collaborators handed to every constructed instance.
pub struct InstanceDeps {
    pub provider: Arc<dyn LlmProvider>,
    pub context: Arc<dyn ContextProvider>,
    pub store: Arc<dyn Persistence>,
    pub ledger: Arc<TurnLedger>,
    pub audit: AuditHandle,
    pub config: Arc<AppConfig>,
}

struct CacheEntry {
    orchestrator: Arc<Orchestrator>,
    last_used: Instant,
}

pub struct InstanceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InstanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Resolve a live instance, constructing one on miss.
    ///
    /// Policy and organization settings are fetched before taking the cache
    /// lock; nothing awaits while the lock is held. Eviction is lazy: every
    /// call first drops entries idle past the TTL.
    pub async fn get_or_create(
        &self,
        request: &InstanceRequest,
        deps: &InstanceDeps,
    ) -> Result<Arc<Orchestrator>, TurnError> {
        let (policy, settings) = self.resolve_governance(request, deps).await?;
        let governance_weight = settings
            .as_ref()
            .map(|s| s.governance_split)
            .unwrap_or(deps.config.orchestrator.governance_weight);
        let spirit_beta = settings
            .as_ref()
            .map(|s| s.spirit_beta)
            .unwrap_or(deps.config.orchestrator.spirit_beta);

        let slug = agent_slug(&request.agent_name);
        let key = cache_key(&slug, request, governance_weight, spirit_beta);
        let now = Instant::now();

        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| now.duration_since(entry.last_used) <= self.ttl);

        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = now;
            debug!(key = %key, "instance cache hit");
            return Ok(Arc::clone(&entry.orchestrator));
        }

        let orchestrator = Arc::new(build_instance(
            &slug,
            request,
            policy.as_ref(),
            governance_weight,
            spirit_beta,
            deps,
        )?);
        entries.insert(key.clone(), CacheEntry { orchestrator: Arc::clone(&orchestrator), last_used: now });
        info!(key = %key, "constructed orchestrator instance");
        Ok(orchestrator)
    }

    /// Drop every cached instance for an agent. Callers already holding an
    /// orchestrator keep using it; only the cache forgets.
    pub fn invalidate_agent(&self, agent_name: &str) -> usize {
        let prefix = format!("{}|", agent_slug(agent_name));
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - entries.len();
        if removed > 0 {
            info!(agent = %agent_name, removed, "invalidated cached instances");
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    async fn resolve_governance(
        &self,
        request: &InstanceRequest,
        deps: &InstanceDeps,
    ) -> Result<(Option<GovernancePolicy>, Option<OrgSettings>), TurnError> {
        let Some(policy_id) = request.policy_id.as_deref() else {
            return Ok((None, None));
        };
        let policy = deps.store.policy(policy_id).await?;
        let settings = match policy.as_ref().and_then(|p| p.org_id.as_deref()) {
            Some(org_id) => deps.store.org_settings(org_id).await?,
            None => None,
        };
        Ok((policy, settings))
    }
}

fn cache_key(
    slug: &str,
    request: &InstanceRequest,
    governance_weight: f64,
    spirit_beta: f64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.intellect_model.as_bytes());
    hasher.update([b'|']);
    hasher.update(request.will_model.as_bytes());
    hasher.update([b'|']);
    hasher.update(request.conscience_model.as_bytes());
    hasher.update([b'|']);
    hasher.update(request.policy_id.as_deref().unwrap_or("").as_bytes());
    hasher.update([b'|']);
    // The org-settings hash keeps instances with different governance math
    // apart even under the same policy id.
    hasher.update(format!("{governance_weight:.6}|{spirit_beta:.6}").as_bytes());
    let digest = hasher.finalize();
    let suffix: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{slug}|{suffix}")
}

pub(crate) fn build_instance(
    slug: &str,
    request: &InstanceRequest,
    policy: Option<&GovernancePolicy>,
    governance_weight: f64,
    spirit_beta: f64,
    deps: &InstanceDeps,
) -> Result<Orchestrator, TurnError> {
    let base = registry::builtin(slug).ok_or_else(|| TurnError::UnknownAgent(slug.to_string()))?;
    let compiled = compile(&base, policy, governance_weight)?;

    let mut models = HashMap::new();
    models.insert(ROUTE_INTELLECT.to_string(), request.intellect_model.clone());
    models.insert(ROUTE_WILL.to_string(), request.will_model.clone());
    models.insert(ROUTE_CONSCIENCE.to_string(), request.conscience_model.clone());
    let bound: Arc<dyn LlmProvider> =
        Arc::new(ModelBoundProvider::new(Arc::clone(&deps.provider), models));

    Ok(Orchestrator::new(
        compiled,
        bound,
        Arc::clone(&deps.context),
        Arc::clone(&deps.store),
        Arc::clone(&deps.ledger),
        deps.audit.clone(),
        OrchestratorOptions {
            spirit_beta,
            mu_history_window: deps.config.orchestrator.mu_history_window,
            enable_profile_extraction: deps.config.orchestrator.enable_profile_extraction,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use ethos_faculties::DisabledContext;
    use ethos_llm::{CallOverrides, ProviderError};
    use ethos_memory::MemStore;

    use crate::audit::spawn_audit_worker;

    struct NullLlm;

    #[async_trait]
    impl LlmProvider for NullLlm {
        async fn invoke(
            &self,
            _route: &str,
            _system_prompt: &str,
            _user_prompt: &str,
            _overrides: CallOverrides,
        ) -> Result<String, ProviderError> {
            Ok(String::new())
        }
    }

    fn deps(dir: &tempfile::TempDir) -> InstanceDeps {
        let mut config = AppConfig::default();
        config.telemetry.turn_log_dir = dir.path().to_string_lossy().into_owned();
        InstanceDeps {
            provider: Arc::new(NullLlm),
            context: Arc::new(DisabledContext),
            store: Arc::new(MemStore::new()),
            ledger: Arc::new(TurnLedger::new(dir.path())),
            audit: spawn_audit_worker(4),
            config: Arc::new(config),
        }
    }

    fn request(agent: &str) -> InstanceRequest {
        InstanceRequest {
            agent_name: agent.to_string(),
            intellect_model: "m1".to_string(),
            will_model: "m2".to_string(),
            conscience_model: "m3".to_string(),
            policy_id: None,
        }
    }

    #[tokio::test]
    async fn repeated_lookups_share_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(&dir);
        let cache = InstanceCache::new(Duration::from_secs(600));

        let first = cache.get_or_create(&request("Fiduciary"), &deps).await.unwrap();
        let second = cache.get_or_create(&request("Fiduciary"), &deps).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn different_models_get_different_instances() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(&dir);
        let cache = InstanceCache::new(Duration::from_secs(600));

        let first = cache.get_or_create(&request("fiduciary"), &deps).await.unwrap();
        let mut other = request("fiduciary");
        other.intellect_model = "different".to_string();
        let second = cache.get_or_create(&other, &deps).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(&dir);
        let cache = InstanceCache::new(Duration::from_secs(600));

        let first = cache.get_or_create(&request("Fiduciary"), &deps).await.unwrap();
        assert_eq!(cache.invalidate_agent("Fiduciary"), 1);
        // Idempotent: nothing left to remove.
        assert_eq!(cache.invalidate_agent("Fiduciary"), 0);

        let second = cache.get_or_create(&request("Fiduciary"), &deps).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalidation_matches_normalized_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(&dir);
        let cache = InstanceCache::new(Duration::from_secs(600));

        cache.get_or_create(&request("fiduciary"), &deps).await.unwrap();
        cache.get_or_create(&request("steward"), &deps).await.unwrap();

        assert_eq!(cache.invalidate_agent("FIDUCIARY"), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn idle_entries_are_evicted_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(&dir);
        let cache = InstanceCache::new(Duration::ZERO);

        let first = cache.get_or_create(&request("fiduciary"), &deps).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache.get_or_create(&request("fiduciary"), &deps).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unknown_agents_fail_construction() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(&dir);
        let cache = InstanceCache::new(Duration::from_secs(600));

        let err = cache.get_or_create(&request("oracle"), &deps).await.unwrap_err();
        assert!(matches!(err, TurnError::UnknownAgent(_)));
    }
}
