//! The turn driver.
//!
//! One orchestrator serves one compiled agent. A turn runs
//! resolve → generate → gate (with at most one reflexion retry) → respond,
//! then hands the deferred faculties to the background audit queue. The
//! caller is never blocked on the audit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use ethos_agent::{AgentProfile, WillDecision};
use ethos_audit::{RetryMetadata, TurnLedger};
use ethos_faculties::{
    ConscienceAuditor, ContextProvider, GenerationInputs, IntellectEngine, SpiritIntegrator,
    WillGate,
};
use ethos_llm::LlmProvider;
use ethos_memory::{AuditStatus, ChatMessage, ChatRole, Persistence};

use crate::audit::{AuditHandle, PendingAudit, TurnSnapshot};
use crate::error::TurnError;
use crate::summarizer::{self, SummarizerJob};

/// Answer shown when the intellect provider is unreachable. No audit runs
/// for such turns.
pub const INTELLECT_FAILURE_MESSAGE: &str = "Sorry, I could not generate an answer.";

/// What `process_prompt` hands back to the outer layer.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub answer: String,
    /// `None` only for the generic intellect-failure answer, which writes no
    /// messages and schedules no audit.
    pub message_id: Option<Uuid>,
    pub will_decision: WillDecision,
    pub will_reason: Option<String>,
    pub new_title: Option<String>,
}

/// Turn-invariant knobs resolved at instance construction.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub spirit_beta: f64,
    pub mu_history_window: usize,
    pub enable_profile_extraction: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

pub struct Orchestrator {
    pub(crate) agent: Arc<AgentProfile>,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) store: Arc<dyn Persistence>,
    pub(crate) ledger: Arc<TurnLedger>,
    pub(crate) conscience: ConscienceAuditor,
    pub(crate) spirit: SpiritIntegrator,
    intellect: IntellectEngine,
    will: WillGate,
    audit: AuditHandle,
    options: OrchestratorOptions,
    /// Recent mu samples for trend tags in the feedback seed. Process-local;
    /// lost on restart by design.
    pub(crate) mu_history: Mutex<VecDeque<Vec<f64>>>,
}

impl Orchestrator {
    pub fn new(
        agent: AgentProfile,
        provider: Arc<dyn LlmProvider>,
        context: Arc<dyn ContextProvider>,
        store: Arc<dyn Persistence>,
        ledger: Arc<TurnLedger>,
        audit: AuditHandle,
        options: OrchestratorOptions,
    ) -> Self {
        let agent = Arc::new(agent);
        let intellect =
            IntellectEngine::new(Arc::clone(&provider), context, Arc::clone(&agent));
        let will = WillGate::new(Arc::clone(&provider), &agent);
        let conscience = ConscienceAuditor::new(Arc::clone(&provider), Arc::clone(&agent));
        let spirit = SpiritIntegrator::new(&agent.values, options.spirit_beta);

        Self {
            agent,
            provider,
            store,
            ledger,
            conscience,
            spirit,
            intellect,
            will,
            audit,
            options,
            mu_history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn agent(&self) -> &AgentProfile {
        &self.agent
    }

    /// Record a mu sample and return the history snapshot, oldest first.
    pub(crate) fn push_mu_sample(&self, mu: Vec<f64>) -> Vec<Vec<f64>> {
        let mut history = self.mu_history.lock().unwrap();
        history.push_back(mu);
        while history.len() > self.options.mu_history_window {
            history.pop_front();
        }
        history.iter().cloned().collect()
    }

    /// Run one governed turn end to end.
    #[instrument(skip_all, fields(agent = %self.agent.key, conversation = %conversation_id))]
    pub async fn process_turn(
        self: &Arc<Self>,
        user_id: &str,
        conversation_id: &str,
        user_prompt: &str,
        user_name: Option<&str>,
    ) -> Result<TurnResponse, TurnError> {
        // ── ingest context ────────────────────────────────────────────────
        let summary = self.store.summary(conversation_id).await?;
        let profile_json = self.store.user_profile_json(user_id).await?;
        let spirit_memory = self.store.spirit_memory(&self.agent.key).await?;
        let new_title =
            self.store.title_from_first_message(conversation_id, user_prompt).await?;

        let inputs = GenerationInputs {
            user_prompt: user_prompt.to_string(),
            memory_summary: summary.clone(),
            spirit_feedback: spirit_memory.last_feedback,
            user_profile_json: profile_json.clone(),
            user_name: user_name.map(ToString::to_string),
            plugin: None,
        };

        // ── intellect ─────────────────────────────────────────────────────
        let Ok(draft) = self.intellect.generate(&inputs, None).await else {
            return Ok(TurnResponse {
                answer: INTELLECT_FAILURE_MESSAGE.to_string(),
                message_id: None,
                will_decision: WillDecision::Approve,
                will_reason: None,
                new_title,
            });
        };

        // ── will, with a single reflexion retry ───────────────────────────
        let summary_clause = (!summary.is_empty()).then_some(summary.as_str());
        let (first_decision, first_reason) =
            self.will.evaluate(user_prompt, &draft.answer, summary_clause).await;

        let mut audited_draft = draft;
        let mut decision = first_decision;
        let mut reason = first_reason.clone();
        let mut retry = None;

        if decision == WillDecision::Violation {
            info!(reason = %first_reason, "draft rejected, running reflexion retry");
            match self.intellect.generate(&inputs, Some(&first_reason)).await {
                Ok(second_draft) => {
                    let (second_decision, second_reason) = self
                        .will
                        .evaluate(user_prompt, &second_draft.answer, summary_clause)
                        .await;
                    retry = Some(RetryMetadata {
                        first_draft: audited_draft.answer.clone(),
                        retry_reason: first_reason,
                    });
                    audited_draft = second_draft;
                    decision = second_decision;
                    reason = second_reason;
                }
                Err(err) => {
                    warn!(error = %err, "reflexion retry failed to generate");
                }
            }
        }

        let answer = if decision == WillDecision::Violation {
            format!("[Blocked: {reason}]")
        } else {
            audited_draft.answer.clone()
        };

        // ── respond ───────────────────────────────────────────────────────
        let message_id = Uuid::new_v4();
        self.store
            .append_message(ChatMessage {
                message_id: Uuid::new_v4(),
                conversation_id: conversation_id.to_string(),
                role: ChatRole::User,
                content: user_prompt.to_string(),
                // No audit applies to the user's own message.
                audit_status: AuditStatus::Complete,
                created_at: chrono::Utc::now(),
            })
            .await?;
        self.store
            .append_message(ChatMessage {
                message_id,
                conversation_id: conversation_id.to_string(),
                role: ChatRole::Assistant,
                content: answer.clone(),
                audit_status: AuditStatus::Pending,
                created_at: chrono::Utc::now(),
            })
            .await?;

        // ── schedule the deferred faculties ───────────────────────────────
        self.audit.submit(PendingAudit {
            message_id,
            orchestrator: Arc::clone(self),
            snapshot: TurnSnapshot {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
                user_prompt: user_prompt.to_string(),
                draft_answer: audited_draft.answer,
                reflection: audited_draft.reflection,
                retrieved_context: audited_draft.context_for_audit,
                will_decision: decision,
                will_reason: reason.clone(),
                memory_summary: summary.clone(),
                final_output: answer.clone(),
                retry,
            },
        });

        let job = SummarizerJob {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            prior_summary: summary,
            user_prompt: user_prompt.to_string(),
            final_output: answer.clone(),
            profile_json: self
                .options
                .enable_profile_extraction
                .then_some(profile_json),
        };
        let provider = Arc::clone(&self.provider);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            summarizer::run(provider, store, job).await;
        });

        Ok(TurnResponse {
            answer,
            message_id: Some(message_id),
            will_decision: decision,
            will_reason: (decision == WillDecision::Violation).then_some(reason),
            new_title,
        })
    }
}

/// Log-and-drop semantics for a full or closed audit queue, shared by
/// [`AuditHandle::submit`].
pub(crate) fn report_submit_failure(err: TrySendError<PendingAudit>) {
    match err {
        TrySendError::Full(pending) => warn!(
            message_id = %pending.message_id,
            "audit queue full, dropping audit; message stays pending"
        ),
        TrySendError::Closed(pending) => warn!(
            message_id = %pending.message_id,
            "audit worker stopped, dropping audit; message stays pending"
        ),
    }
}
