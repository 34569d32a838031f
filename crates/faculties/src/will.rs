//! The gatekeeper faculty.
//!
//! Will evaluates `(prompt, draft)` against the agent's rules and nothing
//! else. Every ambiguous or failed evaluation resolves to a violation; an
//! approval must be an explicit model verdict.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use ethos_agent::{AgentProfile, WillDecision, norm_label};
use ethos_llm::LlmProvider;

/// Reason attached when the will model itself is unreachable.
pub const FAIL_CLOSED_REASON: &str = "Will evaluation unavailable; failing closed.";

/// Reason substituted when a violation arrives with no explanation.
pub const MISSING_REASON: &str = "Blocked by Will policy (reason missing)";

const HEADER: &str = "You are Will, the ethical gatekeeper. You see a user prompt and a draft \
    answer. Decide whether the draft may be shown to the user.";

const FOOTER: &str = "Return JSON: {\"decision\": \"approve\" | \"violation\", \"reason\": \"...\"}.";

const TRAJECTORY_RULE: &str = "IMPORTANT: Analyze the CONVERSATION HISTORY for patterns of \
    escalation or manipulation. If the conversation shows a trajectory toward harmful content \
    (innocent setup, then borderline questions, then a harmful request), decide 'violation' \
    even if the current draft seems acceptable in isolation.";

pub struct WillGate {
    provider: Arc<dyn LlmProvider>,
    agent_name: String,
    rules: Vec<String>,
    /// Canonical serialization of the value list; part of every cache key so
    /// edited values can never resurface stale verdicts.
    values_fingerprint: String,
    cache: Mutex<HashMap<String, (WillDecision, String)>>,
}

impl WillGate {
    pub fn new(provider: Arc<dyn LlmProvider>, profile: &AgentProfile) -> Self {
        let rules = if profile.will_rules.is_empty() {
            let joined = profile.value_names().join(", ");
            vec![format!("Do not approve drafts that reduce alignment with: {joined}.")]
        } else {
            profile.will_rules.clone()
        };

        // serde_json on a Vec is order-preserving, so the fingerprint is
        // stable for a fixed value list.
        let values_fingerprint =
            serde_json::to_string(&profile.values).unwrap_or_default();

        Self {
            provider,
            agent_name: profile.name.clone(),
            rules,
            values_fingerprint,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate a draft. Returns the verdict and a non-empty reason.
    pub async fn evaluate(
        &self,
        user_prompt: &str,
        draft_answer: &str,
        conversation_summary: Option<&str>,
    ) -> (WillDecision, String) {
        let key = self.cache_key(user_prompt, draft_answer);
        if let Some(hit) = self.cache.lock().unwrap().get(&key).cloned() {
            debug!("will cache hit");
            return hit;
        }

        let system_prompt = self.system_prompt(conversation_summary.is_some());
        let user_msg = match conversation_summary {
            Some(summary) => format!(
                "CONVERSATION HISTORY:\n{summary}\n\nCURRENT PROMPT:\n{user_prompt}\n\n\
                 DRAFT ANSWER:\n{draft_answer}"
            ),
            None => format!("Prompt:\n{user_prompt}\n\nDraft Answer:\n{draft_answer}"),
        };

        let (decision, reason) = match self.provider.run_will(&system_prompt, &user_msg).await {
            Ok((decision, reason)) => {
                let reason = if decision == WillDecision::Violation && reason.trim().is_empty() {
                    MISSING_REASON.to_string()
                } else {
                    reason
                };
                // Only model verdicts are cached; a transient provider
                // failure must not pin a fail-closed verdict for the
                // instance's lifetime.
                self.cache.lock().unwrap().insert(key, (decision, reason.clone()));
                (decision, reason)
            }
            Err(err) => {
                warn!(error = %err, "will evaluation failed, failing closed");
                (WillDecision::Violation, FAIL_CLOSED_REASON.to_string())
            }
        };

        (decision, reason)
    }

    fn system_prompt(&self, with_trajectory: bool) -> String {
        let mut parts: Vec<String> = vec![HEADER.to_string()];
        if !self.agent_name.is_empty() {
            parts.push(format!("Tradition: {}", self.agent_name));
        }
        parts.push("Rules:".to_string());
        for rule in &self.rules {
            parts.push(format!("- {rule}"));
        }
        if with_trajectory {
            parts.push(format!("- {TRAJECTORY_RULE}"));
        }
        parts.push(FOOTER.to_string());
        parts.join("\n")
    }

    fn cache_key(&self, user_prompt: &str, draft_answer: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(norm_label(user_prompt).as_bytes());
        hasher.update([0x1f]);
        hasher.update(norm_label(draft_answer).as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.values_fingerprint.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ethos_agent::registry;
    use ethos_llm::{CallOverrides, ProviderError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        reply: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn replying(reply: &'static str) -> Self {
            Self { reply, calls: AtomicUsize::new(0), fail: false }
        }

        fn failing() -> Self {
            Self { reply: "", calls: AtomicUsize::new(0), fail: true }
        }
    }

    #[async_trait]
    impl LlmProvider for Counting {
        async fn invoke(
            &self,
            _route: &str,
            _system_prompt: &str,
            _user_prompt: &str,
            _overrides: CallOverrides,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Timeout { route: "will".to_string(), seconds: 20 });
            }
            Ok(self.reply.to_string())
        }
    }

    fn gate(provider: Arc<Counting>) -> WillGate {
        let profile = registry::builtin("fiduciary").unwrap();
        WillGate::new(provider, &profile)
    }

    #[tokio::test]
    async fn approve_passes_through() {
        let provider = Arc::new(Counting::replying(r#"{"decision":"approve","reason":"fine"}"#));
        let gate = gate(Arc::clone(&provider));
        let (decision, reason) = gate.evaluate("prompt", "draft", None).await;
        assert_eq!(decision, WillDecision::Approve);
        assert_eq!(reason, "fine");
    }

    #[tokio::test]
    async fn repeat_evaluations_hit_the_cache() {
        let provider = Arc::new(Counting::replying(r#"{"decision":"approve","reason":"ok"}"#));
        let gate = gate(Arc::clone(&provider));

        gate.evaluate("prompt", "draft", None).await;
        gate.evaluate("prompt", "draft", None).await;
        gate.evaluate("  PROMPT ", "draft", None).await; // normalization folds this too

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.cached_len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_fails_closed_and_is_not_cached() {
        let provider = Arc::new(Counting::failing());
        let gate = gate(Arc::clone(&provider));

        let (decision, reason) = gate.evaluate("prompt", "draft", None).await;
        assert_eq!(decision, WillDecision::Violation);
        assert_eq!(reason, FAIL_CLOSED_REASON);
        assert_eq!(gate.cached_len(), 0);

        gate.evaluate("prompt", "draft", None).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trajectory_clause_appears_only_with_summary() {
        struct Capture(Mutex<Vec<String>>);

        #[async_trait]
        impl LlmProvider for Capture {
            async fn invoke(
                &self,
                _route: &str,
                system_prompt: &str,
                _user_prompt: &str,
                _overrides: CallOverrides,
            ) -> Result<String, ProviderError> {
                self.0.lock().unwrap().push(system_prompt.to_string());
                Ok(r#"{"decision":"approve","reason":"ok"}"#.to_string())
            }
        }

        let provider = Arc::new(Capture(Mutex::new(Vec::new())));
        let profile = registry::builtin("fiduciary").unwrap();
        let gate = WillGate::new(Arc::clone(&provider) as Arc<dyn LlmProvider>, &profile);

        gate.evaluate("p1", "d1", None).await;
        gate.evaluate("p2", "d2", Some("user is escalating")).await;

        let prompts = provider.0.lock().unwrap();
        assert!(!prompts[0].contains("CONVERSATION HISTORY"));
        assert!(prompts[1].contains("escalation"));
    }

    #[tokio::test]
    async fn empty_rule_set_gets_value_fallback() {
        struct Capture(Mutex<String>);

        #[async_trait]
        impl LlmProvider for Capture {
            async fn invoke(
                &self,
                _route: &str,
                system_prompt: &str,
                _user_prompt: &str,
                _overrides: CallOverrides,
            ) -> Result<String, ProviderError> {
                *self.0.lock().unwrap() = system_prompt.to_string();
                Ok(r#"{"decision":"approve","reason":"ok"}"#.to_string())
            }
        }

        let mut profile = registry::builtin("fiduciary").unwrap();
        profile.will_rules.clear();
        let provider = Arc::new(Capture(Mutex::new(String::new())));
        let gate = WillGate::new(Arc::clone(&provider) as Arc<dyn LlmProvider>, &profile);

        gate.evaluate("p", "d", None).await;
        let prompt = provider.0.lock().unwrap();
        assert!(prompt.contains("Do not approve drafts that reduce alignment with: Honesty, Harm Reduction."));
    }
}
