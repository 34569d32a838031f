//! In-process reference backend for the persistence port.
//!
//! State lives in hash maps behind a `tokio::sync::RwLock`; each agent's
//! spirit row gets its own `Mutex` so spirit transactions serialize per
//! agent without contending on unrelated state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use ethos_agent::{GovernancePolicy, OrgSettings};

use crate::schema::{
    AuditLookup, AuditOutcome, AuditStatus, ChatMessage, Conversation, NEW_CHAT_TITLE,
    SpiritMemory, UserRecord,
};
use crate::store::{Persistence, PersistenceError, SpiritTransaction};

#[derive(Default)]
struct State {
    users: HashMap<String, UserRecord>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<ChatMessage>>,
    message_index: HashMap<Uuid, String>,
    summaries: HashMap<String, String>,
    profiles: HashMap<String, String>,
    usage: HashMap<(String, String), u32>,
    audits: HashMap<Uuid, AuditOutcome>,
    policies: HashMap<String, GovernancePolicy>,
    orgs: HashMap<String, OrgSettings>,
}

#[derive(Default)]
pub struct MemStore {
    state: RwLock<State>,
    spirit: Mutex<HashMap<String, Arc<Mutex<SpiritMemory>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a governance policy (tests and fixtures).
    pub async fn insert_policy(&self, policy: GovernancePolicy) {
        let mut state = self.state.write().await;
        if let Some(org_id) = policy.org_id.clone() {
            state.orgs.entry(org_id).or_default();
        }
        state.policies.insert(policy.id.clone(), policy);
    }

    pub async fn insert_org_settings(&self, org_id: &str, settings: OrgSettings) {
        self.state.write().await.orgs.insert(org_id.to_string(), settings);
    }

    async fn spirit_row(&self, agent_key: &str) -> Arc<Mutex<SpiritMemory>> {
        let mut rows = self.spirit.lock().await;
        rows.entry(agent_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SpiritMemory::empty())))
            .clone()
    }
}

struct MemSpiritTxn {
    guard: OwnedMutexGuard<SpiritMemory>,
}

#[async_trait]
impl SpiritTransaction for MemSpiritTxn {
    fn memory(&self) -> &SpiritMemory {
        &self.guard
    }

    async fn commit(mut self: Box<Self>, updated: SpiritMemory) -> Result<(), PersistenceError> {
        *self.guard = updated;
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[async_trait]
impl Persistence for MemStore {
    async fn user(&self, user_id: &str) -> Result<Option<UserRecord>, PersistenceError> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: UserRecord) -> Result<(), PersistenceError> {
        self.state.write().await.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, PersistenceError> {
        Ok(self.state.read().await.conversations.get(id).cloned())
    }

    async fn create_conversation(
        &self,
        user_id: &str,
    ) -> Result<Conversation, PersistenceError> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: NEW_CHAT_TITLE.to_string(),
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn title_from_first_message(
        &self,
        conversation_id: &str,
        first_message: &str,
    ) -> Result<Option<String>, PersistenceError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| PersistenceError::ConversationNotFound(conversation_id.to_string()))?;

        if conversation.title != NEW_CHAT_TITLE {
            return Ok(None);
        }

        let title = if first_message.chars().count() > 40 {
            let cut: String = first_message.chars().take(40).collect();
            format!("{cut}...")
        } else {
            first_message.to_string()
        };
        conversation.title = title.clone();
        Ok(Some(title))
    }

    async fn append_message(&self, message: ChatMessage) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(PersistenceError::ConversationNotFound(message.conversation_id));
        }
        state
            .message_index
            .insert(message.message_id, message.conversation_id.clone());
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, PersistenceError> {
        let state = self.state.read().await;
        let messages = state.messages.get(conversation_id).cloned().unwrap_or_default();
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn summary(&self, conversation_id: &str) -> Result<String, PersistenceError> {
        Ok(self
            .state
            .read()
            .await
            .summaries
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_summary(
        &self,
        conversation_id: &str,
        summary: &str,
    ) -> Result<(), PersistenceError> {
        self.state
            .write()
            .await
            .summaries
            .insert(conversation_id.to_string(), summary.to_string());
        Ok(())
    }

    async fn user_profile_json(&self, user_id: &str) -> Result<String, PersistenceError> {
        Ok(self
            .state
            .read()
            .await
            .profiles
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| "{}".to_string()))
    }

    async fn set_user_profile_json(
        &self,
        user_id: &str,
        profile: &str,
    ) -> Result<(), PersistenceError> {
        self.state
            .write()
            .await
            .profiles
            .insert(user_id.to_string(), profile.to_string());
        Ok(())
    }

    async fn prompts_today(&self, user_id: &str) -> Result<u32, PersistenceError> {
        let key = (user_id.to_string(), today());
        Ok(self.state.read().await.usage.get(&key).copied().unwrap_or(0))
    }

    async fn record_prompt_usage(&self, user_id: &str) -> Result<(), PersistenceError> {
        let key = (user_id.to_string(), today());
        *self.state.write().await.usage.entry(key).or_insert(0) += 1;
        Ok(())
    }

    async fn set_audit_result(
        &self,
        message_id: Uuid,
        outcome: AuditOutcome,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let conversation_id = state
            .message_index
            .get(&message_id)
            .cloned()
            .ok_or(PersistenceError::MessageNotFound(message_id))?;

        if let Some(messages) = state.messages.get_mut(&conversation_id) {
            for message in messages.iter_mut() {
                if message.message_id == message_id {
                    message.audit_status = AuditStatus::Complete;
                }
            }
        }
        state.audits.insert(message_id, outcome);
        Ok(())
    }

    async fn audit_result(&self, message_id: Uuid) -> Result<AuditLookup, PersistenceError> {
        let state = self.state.read().await;
        if let Some(outcome) = state.audits.get(&message_id) {
            return Ok(AuditLookup::Complete(outcome.clone()));
        }
        if state.message_index.contains_key(&message_id) {
            return Ok(AuditLookup::Pending);
        }
        Ok(AuditLookup::NotFound)
    }

    async fn policy(
        &self,
        policy_id: &str,
    ) -> Result<Option<GovernancePolicy>, PersistenceError> {
        Ok(self.state.read().await.policies.get(policy_id).cloned())
    }

    async fn org_settings(
        &self,
        org_id: &str,
    ) -> Result<Option<OrgSettings>, PersistenceError> {
        Ok(self.state.read().await.orgs.get(org_id).cloned())
    }

    async fn begin_spirit_txn(
        &self,
        agent_key: &str,
    ) -> Result<Box<dyn SpiritTransaction>, PersistenceError> {
        let row = self.spirit_row(agent_key).await;
        let guard = row.lock_owned().await;
        Ok(Box::new(MemSpiritTxn { guard }))
    }

    async fn spirit_memory(&self, agent_key: &str) -> Result<SpiritMemory, PersistenceError> {
        let row = self.spirit_row(agent_key).await;
        let guard = row.lock().await;
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChatRole;

    fn message(conversation_id: &str, role: ChatRole, content: &str) -> ChatMessage {
        ChatMessage {
            message_id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            audit_status: AuditStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn title_applies_only_once() {
        let store = MemStore::new();
        let convo = store.create_conversation("u1").await.unwrap();

        let first = store.title_from_first_message(&convo.id, "Tell me about bonds").await.unwrap();
        assert_eq!(first.as_deref(), Some("Tell me about bonds"));

        let second = store.title_from_first_message(&convo.id, "Another prompt").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn long_titles_are_truncated() {
        let store = MemStore::new();
        let convo = store.create_conversation("u1").await.unwrap();
        let long = "x".repeat(60);
        let title = store.title_from_first_message(&convo.id, &long).await.unwrap().unwrap();
        assert_eq!(title.chars().count(), 43);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn audit_lookup_walks_the_lifecycle() {
        let store = MemStore::new();
        let convo = store.create_conversation("u1").await.unwrap();
        let msg = message(&convo.id, ChatRole::Assistant, "answer");
        let id = msg.message_id;

        assert!(matches!(store.audit_result(id).await.unwrap(), AuditLookup::NotFound));

        store.append_message(msg).await.unwrap();
        assert!(matches!(store.audit_result(id).await.unwrap(), AuditLookup::Pending));

        let outcome = AuditOutcome {
            ledger: vec![],
            spirit_score: 7,
            spirit_note: "Coherence 7/10, drift 0.10".to_string(),
            suggested_prompts: vec![],
        };
        store.set_audit_result(id, outcome).await.unwrap();
        match store.audit_result(id).await.unwrap() {
            AuditLookup::Complete(found) => assert_eq!(found.spirit_score, 7),
            other => panic!("expected Complete, got {other:?}"),
        }

        let history = store.history(&convo.id, 10).await.unwrap();
        assert_eq!(history[0].audit_status, AuditStatus::Complete);
    }

    #[tokio::test]
    async fn quota_counts_per_user() {
        let store = MemStore::new();
        assert_eq!(store.prompts_today("u1").await.unwrap(), 0);
        store.record_prompt_usage("u1").await.unwrap();
        store.record_prompt_usage("u1").await.unwrap();
        store.record_prompt_usage("u2").await.unwrap();
        assert_eq!(store.prompts_today("u1").await.unwrap(), 2);
        assert_eq!(store.prompts_today("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn spirit_transactions_serialize_per_agent() {
        let store = Arc::new(MemStore::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let txn = store.begin_spirit_txn("steward").await.unwrap();
                let mut updated = txn.memory().clone();
                let observed = updated.turn;
                updated.turn += 1;
                txn.commit(updated).await.unwrap();
                observed
            }));
        }

        let mut observed = Vec::new();
        for handle in handles {
            observed.push(handle.await.unwrap());
        }
        observed.sort_unstable();

        // Every transaction saw a distinct prior turn, and the final count
        // equals the number of commits.
        assert_eq!(observed, (0..16).collect::<Vec<u64>>());
        assert_eq!(store.spirit_memory("steward").await.unwrap().turn, 16);
    }

    #[tokio::test]
    async fn abort_leaves_the_row_untouched() {
        let store = MemStore::new();
        let txn = store.begin_spirit_txn("steward").await.unwrap();
        txn.abort().await;
        assert_eq!(store.spirit_memory("steward").await.unwrap().turn, 0);
    }

    #[tokio::test]
    async fn history_respects_limit() {
        let store = MemStore::new();
        let convo = store.create_conversation("u1").await.unwrap();
        for i in 0..5 {
            store
                .append_message(message(&convo.id, ChatRole::User, &format!("m{i}")))
                .await
                .unwrap();
        }
        let tail = store.history(&convo.id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].content, "m4");
    }
}
