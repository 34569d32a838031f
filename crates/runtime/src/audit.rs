//! The background audit path.
//!
//! The user already has the answer; this worker runs Conscience, Spirit,
//! and suggestion generation against the pending message id, under the
//! per-agent spirit lock. Best-effort by design: the queue is bounded,
//! dropped submissions are logged, and a failed audit leaves the message
//! `pending` for the client poll to observe.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use ethos_agent::WillDecision;
use ethos_audit::{RetryMetadata, TurnRecord};
use ethos_faculties::build_spirit_feedback;
use ethos_memory::{AuditOutcome, PersistenceError, SpiritMemory};

use crate::orchestrator::{Orchestrator, report_submit_failure};
use crate::suggestions;

/// Everything the deferred faculties need, captured at respond time.
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub user_id: String,
    pub conversation_id: String,
    pub user_prompt: String,
    /// The draft the conscience scores. For blocked turns this is the
    /// rejected draft, not the `[Blocked: ...]` surface.
    pub draft_answer: String,
    pub reflection: String,
    pub retrieved_context: String,
    pub will_decision: WillDecision,
    pub will_reason: String,
    pub memory_summary: String,
    /// What the user actually saw.
    pub final_output: String,
    pub retry: Option<RetryMetadata>,
}

pub struct PendingAudit {
    pub message_id: Uuid,
    pub orchestrator: Arc<Orchestrator>,
    pub snapshot: TurnSnapshot,
}

/// Clonable submission side of the audit queue.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<PendingAudit>,
}

impl AuditHandle {
    /// Non-blocking submit. A full queue drops the audit with a log line;
    /// there is no retry and no durable backlog.
    pub fn submit(&self, pending: PendingAudit) {
        if let Err(err) = self.tx.try_send(pending) {
            report_submit_failure(err);
        }
    }
}

/// Start the audit worker. Must be called from within a tokio runtime; the
/// worker stops when every handle clone is dropped.
pub fn spawn_audit_worker(capacity: usize) -> AuditHandle {
    let (tx, mut rx) = mpsc::channel::<PendingAudit>(capacity);
    tokio::spawn(async move {
        while let Some(pending) = rx.recv().await {
            let message_id = pending.message_id;
            if let Err(err) = audit_once(pending).await {
                warn!(message_id = %message_id, error = %err, "audit failed; message stays pending");
            }
        }
    });
    AuditHandle { tx }
}

/// One full audit transaction for one turn.
async fn audit_once(pending: PendingAudit) -> Result<(), PersistenceError> {
    let orchestrator = &pending.orchestrator;
    let snapshot = &pending.snapshot;
    let agent = orchestrator.agent();

    // The whole read-modify-write happens under the per-agent row lock, so
    // concurrent audits for one agent serialize here.
    let txn = orchestrator.store.begin_spirit_txn(&agent.key).await?;
    let mut memory = txn.memory().clone();

    let dim = orchestrator.spirit.dim();
    if memory.mu.len() != dim {
        if memory.turn > 0 || !memory.mu.is_empty() {
            warn!(
                agent = %agent.key,
                have = memory.mu.len(),
                want = dim,
                "spirit dimension mismatch, resetting memory"
            );
        }
        memory = SpiritMemory::zeros(dim);
    }

    let ledger = orchestrator
        .conscience
        .evaluate(
            &snapshot.draft_answer,
            &snapshot.user_prompt,
            &snapshot.reflection,
            &snapshot.retrieved_context,
        )
        .await;

    let update = orchestrator.spirit.compute(&ledger, &memory.mu);

    let history = orchestrator.push_mu_sample(update.mu_new.clone());
    let value_names = agent.value_names();
    let feedback = build_spirit_feedback(
        &update.mu_new,
        &value_names,
        update.drift.unwrap_or(0.0),
        Some(&history),
    );

    // Suggestions are decorative; failure must not touch the transaction.
    let suggested_prompts = match snapshot.will_decision {
        WillDecision::Approve => {
            suggestions::follow_up_suggestions(
                orchestrator.provider.as_ref(),
                &snapshot.user_prompt,
                &snapshot.final_output,
            )
            .await
        }
        WillDecision::Violation => {
            suggestions::compliant_rephrasings(
                orchestrator.provider.as_ref(),
                &snapshot.user_prompt,
                &agent.will_rules,
            )
            .await
        }
    };

    let outcome = AuditOutcome {
        ledger: ledger.clone(),
        spirit_score: update.spirit_score,
        spirit_note: update.note.clone(),
        suggested_prompts,
    };
    if let Err(err) = orchestrator.store.set_audit_result(pending.message_id, outcome).await {
        txn.abort().await;
        return Err(err);
    }

    let turn_index = memory.turn + 1;
    memory.turn = turn_index;
    memory.mu = update.mu_new.clone();
    memory.last_feedback = feedback.clone();
    txn.commit(memory).await?;

    let record = TurnRecord {
        timestamp: Utc::now(),
        agent_key: agent.key.clone(),
        turn_index,
        user_id: snapshot.user_id.clone(),
        user_prompt: snapshot.user_prompt.clone(),
        intellect_draft: snapshot.draft_answer.clone(),
        intellect_reflection: snapshot.reflection.clone(),
        retrieved_context: snapshot.retrieved_context.clone(),
        will_decision: snapshot.will_decision,
        will_reason: snapshot.will_reason.clone(),
        conscience_ledger: ledger,
        spirit_score: update.spirit_score,
        spirit_note: update.note.clone(),
        drift: update.drift,
        p_t: update.p_t,
        mu_after: update.mu_new,
        spirit_feedback: feedback,
        memory_summary: snapshot.memory_summary.clone(),
        final_output: snapshot.final_output.clone(),
        policy_id: agent.policy_id.clone(),
        org_id: agent.org_id.clone(),
        retry: snapshot.retry.clone(),
    };
    if let Err(err) = orchestrator.ledger.append(&record).await {
        // The audit itself committed; a lost log line is not worth failing
        // the message over.
        warn!(agent = %agent.key, turn = turn_index, error = %err, "turn ledger append failed");
    }

    info!(
        agent = %agent.key,
        turn = turn_index,
        score = update.spirit_score,
        "audit complete"
    );
    Ok(())
}
