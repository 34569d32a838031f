//! The narrow persistence port the core depends on.
//!
//! Everything stateful outside the instance cache lives behind this trait:
//! conversations, chat history, audit results, summaries, user profiles, the
//! daily prompt quota, governance lookups, and the spirit memory rows. SQL
//! backends implement it elsewhere; [`crate::MemStore`] is the in-process
//! reference implementation.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use ethos_agent::{GovernancePolicy, OrgSettings};

use crate::schema::{
    AuditLookup, AuditOutcome, ChatMessage, Conversation, SpiritMemory, UserRecord,
};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("conversation '{0}' not found")]
    ConversationNotFound(String),
    #[error("user '{0}' not found")]
    UserNotFound(String),
    #[error("message '{0}' not found")]
    MessageNotFound(Uuid),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A held lock on one agent's spirit memory row.
///
/// Two audits for the same agent must never interleave their
/// read-modify-write on `mu`; backends guarantee that by handing out one
/// live transaction per agent key at a time (`SELECT ... FOR UPDATE` or an
/// equivalent row lock). Dropping the transaction without committing
/// releases the lock and discards nothing but the lock itself.
#[async_trait]
pub trait SpiritTransaction: Send {
    /// The row as loaded under the lock.
    fn memory(&self) -> &SpiritMemory;

    /// Persist `updated` and release the lock.
    async fn commit(self: Box<Self>, updated: SpiritMemory) -> Result<(), PersistenceError>;

    /// Release the lock leaving the row untouched.
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait Persistence: Send + Sync {
    // ── users ──────────────────────────────────────────────────────────────
    async fn user(&self, user_id: &str) -> Result<Option<UserRecord>, PersistenceError>;
    async fn upsert_user(&self, user: UserRecord) -> Result<(), PersistenceError>;

    // ── conversations & history ────────────────────────────────────────────
    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, PersistenceError>;
    async fn create_conversation(
        &self,
        user_id: &str,
    ) -> Result<Conversation, PersistenceError>;
    /// Set the title from the first message iff the conversation still has
    /// the placeholder title. Returns the applied title when it changed.
    async fn title_from_first_message(
        &self,
        conversation_id: &str,
        first_message: &str,
    ) -> Result<Option<String>, PersistenceError>;
    async fn append_message(&self, message: ChatMessage) -> Result<(), PersistenceError>;
    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, PersistenceError>;

    // ── summaries & user profiles ──────────────────────────────────────────
    async fn summary(&self, conversation_id: &str) -> Result<String, PersistenceError>;
    async fn set_summary(
        &self,
        conversation_id: &str,
        summary: &str,
    ) -> Result<(), PersistenceError>;
    /// Long-term user profile as a JSON string; `"{}"` when absent.
    async fn user_profile_json(&self, user_id: &str) -> Result<String, PersistenceError>;
    async fn set_user_profile_json(
        &self,
        user_id: &str,
        profile: &str,
    ) -> Result<(), PersistenceError>;

    // ── daily quota ────────────────────────────────────────────────────────
    async fn prompts_today(&self, user_id: &str) -> Result<u32, PersistenceError>;
    async fn record_prompt_usage(&self, user_id: &str) -> Result<(), PersistenceError>;

    // ── audit results ──────────────────────────────────────────────────────
    /// Write the audit outcome and flip the message to `Complete`.
    async fn set_audit_result(
        &self,
        message_id: Uuid,
        outcome: AuditOutcome,
    ) -> Result<(), PersistenceError>;
    async fn audit_result(&self, message_id: Uuid) -> Result<AuditLookup, PersistenceError>;

    // ── governance ─────────────────────────────────────────────────────────
    async fn policy(
        &self,
        policy_id: &str,
    ) -> Result<Option<GovernancePolicy>, PersistenceError>;
    async fn org_settings(&self, org_id: &str)
    -> Result<Option<OrgSettings>, PersistenceError>;

    // ── spirit memory ──────────────────────────────────────────────────────
    /// Load one agent's spirit row under an exclusive lock. Blocks until any
    /// earlier transaction on the same key commits or aborts.
    async fn begin_spirit_txn(
        &self,
        agent_key: &str,
    ) -> Result<Box<dyn SpiritTransaction>, PersistenceError>;
    /// Lock-free read of the current spirit row, for turn-time context.
    async fn spirit_memory(&self, agent_key: &str) -> Result<SpiritMemory, PersistenceError>;
}
