use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ethos_agent::LedgerEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub conversation_id: String,
    pub role: ChatRole,
    pub content: String,
    pub audit_status: AuditStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Title given to conversations before their first message arrives.
pub const NEW_CHAT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    /// Persona the user last selected; `None` falls back to the configured
    /// default agent.
    #[serde(default)]
    pub active_agent: Option<String>,
    #[serde(default)]
    pub intellect_model: Option<String>,
    #[serde(default)]
    pub will_model: Option<String>,
    #[serde(default)]
    pub conscience_model: Option<String>,
}

/// Per-agent alignment memory: an EMA vector over the agent's value
/// dimensions plus the feedback seed handed to the next turn's intellect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiritMemory {
    pub turn: u64,
    pub mu: Vec<f64>,
    pub last_feedback: String,
}

impl SpiritMemory {
    pub fn zeros(dim: usize) -> Self {
        Self { turn: 0, mu: vec![0.0; dim], last_feedback: String::new() }
    }

    /// Fresh memory for an agent never audited before. The first audit
    /// resizes it to the agent's dimension.
    pub fn empty() -> Self {
        Self::zeros(0)
    }
}

/// Everything the background audit persists against a message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub ledger: Vec<LedgerEntry>,
    pub spirit_score: u8,
    pub spirit_note: String,
    #[serde(default)]
    pub suggested_prompts: Vec<String>,
}

/// Result of polling a message's audit state.
#[derive(Debug, Clone)]
pub enum AuditLookup {
    NotFound,
    Pending,
    Complete(AuditOutcome),
}
