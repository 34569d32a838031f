//! The outer surface of the core.
//!
//! HTTP, sessions, and auth live elsewhere; they call these three
//! operations. `process_prompt` blocks until the synchronous faculties
//! finish, `audit_result` is the idempotent poll for the deferred ones, and
//! `invalidate_agent` drops cached instances after an agent edit.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;
use uuid::Uuid;

use ethos_agent::{agent_slug, registry};
use ethos_audit::TurnLedger;
use ethos_config::AppConfig;
use ethos_faculties::ContextProvider;
use ethos_llm::{LlmProvider, ROUTE_CONSCIENCE, ROUTE_INTELLECT, ROUTE_WILL};
use ethos_memory::{AuditLookup, Persistence, UserRecord};

use crate::audit::spawn_audit_worker;
use crate::cache::{InstanceCache, InstanceDeps, InstanceRequest};
use crate::error::TurnError;
use crate::orchestrator::TurnResponse;

pub struct EthosService {
    deps: InstanceDeps,
    cache: InstanceCache,
}

impl EthosService {
    /// Build the service. Must be called from within a tokio runtime; the
    /// background audit worker starts immediately.
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn LlmProvider>,
        context: Arc<dyn ContextProvider>,
        store: Arc<dyn Persistence>,
    ) -> Self {
        let config = Arc::new(config);
        let ledger = Arc::new(TurnLedger::new(config.telemetry.turn_log_dir.clone()));
        let audit = spawn_audit_worker(config.orchestrator.audit_queue_capacity);
        let cache =
            InstanceCache::new(Duration::from_secs(config.orchestrator.instance_cache_ttl_secs));

        Self {
            deps: InstanceDeps { provider, context, store, ledger, audit, config },
            cache,
        }
    }

    /// Run one governed turn for a user.
    pub async fn process_prompt(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_prompt: &str,
        agent_selector: Option<&str>,
    ) -> Result<TurnResponse, TurnError> {
        self.process_prompt_governed(user_id, conversation_id, user_prompt, agent_selector, None)
            .await
    }

    /// Like [`Self::process_prompt`], with an organizational policy bound to
    /// the instance (external integrations authenticate per policy).
    #[instrument(skip_all, fields(user = %user_id, conversation = %conversation_id))]
    pub async fn process_prompt_governed(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_prompt: &str,
        agent_selector: Option<&str>,
        policy_id: Option<&str>,
    ) -> Result<TurnResponse, TurnError> {
        let store = &self.deps.store;
        let config = &self.deps.config;

        let limit = config.orchestrator.daily_prompt_limit;
        if limit > 0 {
            if store.prompts_today(user_id).await? >= limit {
                return Err(TurnError::QuotaExceeded(limit));
            }
            store.record_prompt_usage(user_id).await?;
        }

        let user = store
            .user(user_id)
            .await?
            .ok_or_else(|| TurnError::UnknownUser(user_id.to_string()))?;
        let conversation = store
            .conversation(conversation_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| TurnError::UnknownConversation(conversation_id.to_string()))?;

        let request = self.resolve_instance(&user, agent_selector, policy_id)?;
        let orchestrator = self.cache.get_or_create(&request, &self.deps).await?;

        let first_name = user.name.split_whitespace().next().map(ToString::to_string);
        orchestrator
            .process_turn(user_id, &conversation.id, user_prompt, first_name.as_deref())
            .await
    }

    /// Poll the audit state of a message. Idempotent and side-effect free.
    pub async fn audit_result(&self, message_id: Uuid) -> Result<AuditLookup, TurnError> {
        Ok(self.deps.store.audit_result(message_id).await?)
    }

    /// Drop every cached instance of an agent. Returns how many were
    /// removed; calling again is a no-op.
    pub fn invalidate_agent(&self, agent_key: &str) -> usize {
        self.cache.invalidate_agent(agent_key)
    }

    /// Effective model triple: agent override, then user preference, then
    /// the configured route default.
    fn resolve_instance(
        &self,
        user: &UserRecord,
        agent_selector: Option<&str>,
        policy_id: Option<&str>,
    ) -> Result<InstanceRequest, TurnError> {
        let config = &self.deps.config;
        let agent_name = agent_selector
            .map(ToString::to_string)
            .or_else(|| user.active_agent.clone())
            .unwrap_or_else(|| config.orchestrator.default_agent_key.clone());
        let slug = agent_slug(&agent_name);
        let base = registry::builtin(&slug).ok_or_else(|| TurnError::UnknownAgent(slug.clone()))?;

        let route_default = |route: &str| {
            config.llm.routes.get(route).map(|r| r.model.clone()).unwrap_or_default()
        };
        let pick = |agent_choice: &Option<String>, user_choice: &Option<String>, route: &str| {
            agent_choice
                .clone()
                .or_else(|| user_choice.clone())
                .unwrap_or_else(|| route_default(route))
        };

        Ok(InstanceRequest {
            agent_name: slug,
            intellect_model: pick(&base.models.intellect, &user.intellect_model, ROUTE_INTELLECT),
            will_model: pick(&base.models.will, &user.will_model, ROUTE_WILL),
            conscience_model: pick(
                &base.models.conscience,
                &user.conscience_model,
                ROUTE_CONSCIENCE,
            ),
            policy_id: policy_id.map(ToString::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ethos_agent::{GovernancePolicy, OrgSettings, Rubric, Value, WillDecision};
    use ethos_faculties::DisabledContext;
    use ethos_faculties::assemble_reply;
    use ethos_llm::{CallOverrides, ProviderError};
    use ethos_memory::MemStore;

    use crate::orchestrator::INTELLECT_FAILURE_MESSAGE;

    /// Route-keyed scripted provider. Queued replies pop first; defaults
    /// keep unscripted routes functional.
    #[derive(Default)]
    struct ScriptedLlm {
        intellect: Mutex<VecDeque<String>>,
        will: Mutex<VecDeque<String>>,
        conscience: Mutex<VecDeque<String>>,
        fail_routes: Mutex<HashSet<String>>,
        intellect_calls: AtomicUsize,
        will_calls: AtomicUsize,
        conscience_calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn push_intellect(&self, answer: &str, reflection: &str) {
            self.intellect.lock().unwrap().push_back(assemble_reply(answer, reflection));
        }

        fn push_will(&self, decision: &str, reason: &str) {
            self.will
                .lock()
                .unwrap()
                .push_back(format!(r#"{{"decision": "{decision}", "reason": "{reason}"}}"#));
        }

        fn push_conscience(&self, raw: &str) {
            self.conscience.lock().unwrap().push_back(raw.to_string());
        }

        fn fail_route(&self, route: &str) {
            self.fail_routes.lock().unwrap().insert(route.to_string());
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn invoke(
            &self,
            route: &str,
            _system_prompt: &str,
            _user_prompt: &str,
            _overrides: CallOverrides,
        ) -> Result<String, ProviderError> {
            if self.fail_routes.lock().unwrap().contains(route) {
                return Err(ProviderError::Timeout { route: route.to_string(), seconds: 1 });
            }
            match route {
                "intellect" => {
                    self.intellect_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(self
                        .intellect
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| assemble_reply("Hello there.", "trivial greeting")))
                }
                "will" => {
                    self.will_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(self
                        .will
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| r#"{"decision": "approve", "reason": "fine"}"#.to_string()))
                }
                "conscience" => {
                    self.conscience_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(self
                        .conscience
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| r#"{"evaluations": []}"#.to_string()))
                }
                "summarizer" => Ok("The user and the agent discussed finances.".to_string()),
                "suggestions" => Ok(r#"{"suggestions": ["Tell me more"]}"#.to_string()),
                other => Err(ProviderError::UnknownRoute(other.to_string())),
            }
        }
    }

    struct Fixture {
        service: EthosService,
        store: Arc<MemStore>,
        llm: Arc<ScriptedLlm>,
        conversation_id: String,
        _log_dir: tempfile::TempDir,
    }

    async fn fixture_with(limit: u32) -> Fixture {
        let log_dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.telemetry.turn_log_dir = log_dir.path().to_string_lossy().into_owned();
        config.orchestrator.daily_prompt_limit = limit;
        config.orchestrator.default_agent_key = "fiduciary".to_string();

        let store = Arc::new(MemStore::new());
        store
            .upsert_user(UserRecord {
                id: "u1".to_string(),
                name: "Dana Vale".to_string(),
                active_agent: None,
                intellect_model: None,
                will_model: None,
                conscience_model: None,
            })
            .await
            .unwrap();
        let conversation = store.create_conversation("u1").await.unwrap();

        let llm = Arc::new(ScriptedLlm::default());
        let service = EthosService::new(
            config,
            Arc::clone(&llm) as Arc<dyn LlmProvider>,
            Arc::new(DisabledContext),
            Arc::clone(&store) as Arc<dyn Persistence>,
        );

        Fixture { service, store, llm, conversation_id: conversation.id, _log_dir: log_dir }
    }

    async fn fixture() -> Fixture {
        fixture_with(0).await
    }

    async fn wait_for_audit(service: &EthosService, message_id: Uuid) -> ethos_memory::AuditOutcome {
        for _ in 0..200 {
            if let AuditLookup::Complete(outcome) = service.audit_result(message_id).await.unwrap()
            {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("audit for {message_id} never completed");
    }

    async fn wait_for_turn(store: &MemStore, agent_key: &str, turn: u64) {
        for _ in 0..300 {
            if store.spirit_memory(agent_key).await.unwrap().turn >= turn {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {agent_key} never reached turn {turn}");
    }

    fn long_prompt() -> String {
        format!("I have been reading about retirement accounts. {}", "Detail. ".repeat(20))
    }

    fn long_answer(label: &str) -> String {
        format!("{label}: index funds spread risk across many holdings. {}", "More. ".repeat(20))
    }

    // ── approve path (short interaction) ───────────────────────────────────

    #[tokio::test]
    async fn approve_path_skips_conscience_for_short_turns() {
        let fx = fixture().await;

        let response = fx
            .service
            .process_prompt("u1", &fx.conversation_id, "Hi", None)
            .await
            .unwrap();

        assert_eq!(response.answer, "Hello there.");
        assert_eq!(response.will_decision, WillDecision::Approve);
        assert!(response.will_reason.is_none());
        assert_eq!(response.new_title.as_deref(), Some("Hi"));

        let outcome = wait_for_audit(&fx.service, response.message_id.unwrap()).await;
        assert!(outcome.ledger.is_empty());
        assert_eq!(outcome.spirit_score, 1);
        assert!(outcome.spirit_note.starts_with("Coherence 1/10"));
        assert_eq!(fx.llm.conscience_calls.load(Ordering::SeqCst), 0);

        let memory = fx.store.spirit_memory("fiduciary").await.unwrap();
        assert_eq!(memory.turn, 1);
        assert_eq!(memory.mu, vec![0.0, 0.0]);
    }

    // ── reflexion retry ────────────────────────────────────────────────────

    #[tokio::test]
    async fn reflexion_recovers_after_violation() {
        let fx = fixture().await;
        let prompt = long_prompt();
        let second = long_answer("Revised");

        fx.llm.push_intellect(&long_answer("First"), "too prescriptive");
        fx.llm.push_intellect(&second, "kept it educational");
        fx.llm.push_will("violation", "Implies specific financial advice.");
        fx.llm.push_will("approve", "educational framing");
        fx.llm.push_conscience(
            r#"{"evaluations": [
                {"value": "Honesty", "score": 1, "confidence": 0.9, "reason": "accurate"},
                {"value": "Harm Reduction", "score": 1, "confidence": 0.8, "reason": "careful"}
            ]}"#,
        );

        let response =
            fx.service.process_prompt("u1", &fx.conversation_id, &prompt, None).await.unwrap();

        assert_eq!(response.answer, second);
        assert_eq!(response.will_decision, WillDecision::Approve);
        // Reflexion bound: at most two intellect and two will calls.
        assert_eq!(fx.llm.intellect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.llm.will_calls.load(Ordering::SeqCst), 2);

        let outcome = wait_for_audit(&fx.service, response.message_id.unwrap()).await;
        assert!(outcome.spirit_score >= 8);
        assert_eq!(outcome.ledger.len(), 2);

        // One EMA step from zeros with beta 0.9: mu = 0.1 * p_t, p_t = w * s.
        let memory = fx.store.spirit_memory("fiduciary").await.unwrap();
        assert_eq!(memory.turn, 1);
        for (got, want) in memory.mu.iter().zip([0.06, 0.04]) {
            assert!((got - want).abs() < 1e-9, "mu component {got} != {want}");
        }
        assert!(!memory.last_feedback.is_empty());
    }

    // ── block after reflexion ──────────────────────────────────────────────

    #[tokio::test]
    async fn second_violation_blocks_the_turn_but_still_audits() {
        let fx = fixture().await;
        let prompt = long_prompt();

        fx.llm.push_intellect(&long_answer("First"), "r1");
        fx.llm.push_intellect(&long_answer("Second"), "r2");
        fx.llm.push_will("violation", "Implies specific financial advice.");
        fx.llm.push_will("violation", "Still individualized advice.");
        fx.llm.push_conscience(
            r#"{"evaluations": [
                {"value": "Honesty", "score": -1, "confidence": 1.0, "reason": "misleading"},
                {"value": "Harm Reduction", "score": -1, "confidence": 1.0, "reason": "risky"}
            ]}"#,
        );

        let response =
            fx.service.process_prompt("u1", &fx.conversation_id, &prompt, None).await.unwrap();

        assert_eq!(response.answer, "[Blocked: Still individualized advice.]");
        assert_eq!(response.will_decision, WillDecision::Violation);
        assert_eq!(response.will_reason.as_deref(), Some("Still individualized advice."));

        let outcome = wait_for_audit(&fx.service, response.message_id.unwrap()).await;
        assert_eq!(outcome.ledger.len(), 2);

        // The blocked draft produced a negative observation.
        let memory = fx.store.spirit_memory("fiduciary").await.unwrap();
        assert!(memory.mu.iter().all(|m| *m < 0.0), "expected negative mu, got {:?}", memory.mu);
    }

    // ── ledger alignment failure ───────────────────────────────────────────

    #[tokio::test]
    async fn missing_ledger_value_freezes_spirit_memory() {
        let fx = fixture().await;
        let prompt = long_prompt();

        fx.llm.push_intellect(&long_answer("Answer"), "r");
        fx.llm.push_conscience(
            r#"{"evaluations": [
                {"value": "HONESTY", "score": 1, "confidence": 1.0, "reason": "fine"}
            ]}"#,
        );

        let response =
            fx.service.process_prompt("u1", &fx.conversation_id, &prompt, None).await.unwrap();
        let outcome = wait_for_audit(&fx.service, response.message_id.unwrap()).await;

        assert_eq!(outcome.spirit_score, 1);
        assert!(outcome.spirit_note.contains("Ledger missing: Harm Reduction"));

        let memory = fx.store.spirit_memory("fiduciary").await.unwrap();
        assert_eq!(memory.turn, 1);
        assert_eq!(memory.mu, vec![0.0, 0.0]);
    }

    // ── concurrent audits ──────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_turns_produce_distinct_turn_indexes() {
        let fx = Arc::new(fixture().await);

        let mut handles = Vec::new();
        for _ in 0..12 {
            let fx = Arc::clone(&fx);
            handles.push(tokio::spawn(async move {
                fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        wait_for_turn(&fx.store, "fiduciary", 12).await;
        let memory = fx.store.spirit_memory("fiduciary").await.unwrap();
        assert_eq!(memory.turn, 12);

        let ledger = TurnLedger::new(fx._log_dir.path());
        let records = ledger.load_day("fiduciary", chrono::Utc::now().date_naive()).unwrap();
        assert_eq!(records.len(), 12);
        let indexes: HashSet<u64> = records.iter().map(|r| r.turn_index).collect();
        assert_eq!(indexes.len(), 12, "duplicate turn indexes in the ledger");
    }

    // ── failure propagation ────────────────────────────────────────────────

    #[tokio::test]
    async fn intellect_failure_degrades_to_generic_answer() {
        let fx = fixture().await;
        fx.llm.fail_route("intellect");

        let response =
            fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap();

        assert_eq!(response.answer, INTELLECT_FAILURE_MESSAGE);
        assert!(response.message_id.is_none());
        // No messages were written and no audit scheduled.
        let history = fx.store.history(&fx.conversation_id, 10).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn will_failure_fails_closed_and_still_audits() {
        let fx = fixture().await;
        fx.llm.fail_route("will");

        let response =
            fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap();

        assert_eq!(response.will_decision, WillDecision::Violation);
        assert!(response.answer.starts_with("[Blocked: "));
        assert!(response.answer.contains("failing closed"));

        let outcome = wait_for_audit(&fx.service, response.message_id.unwrap()).await;
        assert_eq!(outcome.spirit_score, 1); // short blocked turn, empty ledger
        assert_eq!(fx.store.spirit_memory("fiduciary").await.unwrap().turn, 1);
    }

    // ── quota & validation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn daily_quota_is_enforced_before_resolution() {
        let fx = fixture_with(2).await;

        fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap();
        fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap();
        let err =
            fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap_err();
        assert!(matches!(err, TurnError::QuotaExceeded(2)));
    }

    #[tokio::test]
    async fn unknown_users_agents_and_conversations_are_rejected() {
        let fx = fixture().await;

        let err =
            fx.service.process_prompt("ghost", &fx.conversation_id, "Hi", None).await.unwrap_err();
        assert!(matches!(err, TurnError::UnknownUser(_)));

        let err = fx.service.process_prompt("u1", "no-such-convo", "Hi", None).await.unwrap_err();
        assert!(matches!(err, TurnError::UnknownConversation(_)));

        let err = fx
            .service
            .process_prompt("u1", &fx.conversation_id, "Hi", Some("oracle"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::UnknownAgent(_)));
    }

    // ── governance ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn governed_turns_stamp_policy_and_widen_the_value_set() {
        let fx = fixture().await;
        fx.store
            .insert_org_settings("org-9", OrgSettings { governance_split: 0.40, spirit_beta: 0.9 })
            .await;
        fx.store
            .insert_policy(GovernancePolicy {
                id: "pol-1".to_string(),
                org_id: Some("org-9".to_string()),
                global_worldview: "Comply with regulation.".to_string(),
                global_will_rules: vec!["Escalate legal questions.".to_string()],
                global_values: vec![Value {
                    name: "Compliance".to_string(),
                    weight: 1.0,
                    rubric: Rubric::default(),
                }],
            })
            .await;

        let response = fx
            .service
            .process_prompt_governed("u1", &fx.conversation_id, "Hi", None, Some("pol-1"))
            .await
            .unwrap();
        wait_for_audit(&fx.service, response.message_id.unwrap()).await;

        // Three value dimensions now: Compliance + the agent's two.
        let memory = fx.store.spirit_memory("fiduciary").await.unwrap();
        assert_eq!(memory.mu.len(), 3);

        let ledger = TurnLedger::new(fx._log_dir.path());
        let records = ledger.load_day("fiduciary", chrono::Utc::now().date_naive()).unwrap();
        assert_eq!(records[0].policy_id.as_deref(), Some("pol-1"));
        assert_eq!(records[0].org_id.as_deref(), Some("org-9"));
    }

    // ── summarizer ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn summarizer_updates_the_conversation_summary() {
        let fx = fixture().await;
        let response =
            fx.service.process_prompt("u1", &fx.conversation_id, "Hi", None).await.unwrap();
        wait_for_audit(&fx.service, response.message_id.unwrap()).await;

        // The summarizer is fire-and-forget; give it a moment.
        for _ in 0..100 {
            if !fx.store.summary(&fx.conversation_id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let summary = fx.store.summary(&fx.conversation_id).await.unwrap();
        assert_eq!(summary, "The user and the agent discussed finances.");
    }
}
