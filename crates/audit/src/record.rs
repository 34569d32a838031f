use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ethos_agent::{LedgerEntry, WillDecision};

/// Present when the turn went through a reflexion retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// The draft the gatekeeper rejected.
    pub first_draft: String,
    /// The rejection reason injected into the retry.
    pub retry_reason: String,
}

/// One completed audit, exactly one line in the agent's daily ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_key: String,
    /// Monotonic per agent, not per conversation.
    pub turn_index: u64,
    pub user_id: String,
    pub user_prompt: String,
    pub intellect_draft: String,
    pub intellect_reflection: String,
    pub retrieved_context: String,
    pub will_decision: WillDecision,
    pub will_reason: String,
    pub conscience_ledger: Vec<LedgerEntry>,
    pub spirit_score: u8,
    pub spirit_note: String,
    pub drift: Option<f64>,
    pub p_t: Vec<f64>,
    pub mu_after: Vec<f64>,
    /// The feedback seed computed for the *next* turn.
    pub spirit_feedback: String,
    pub memory_summary: String,
    pub final_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryMetadata>,
}
