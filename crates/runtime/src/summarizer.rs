//! Fire-and-forget conversation summarization.
//!
//! After every turn a detached task rewrites the rolling conversation
//! summary from the latest exchange, and (when enabled) the long-term user
//! profile JSON. Failures are logged and ignored; the next turn simply sees
//! the previous summary.

use std::sync::Arc;

use tracing::{debug, warn};

use ethos_llm::{CallOverrides, LlmProvider, ROUTE_SUMMARIZER, extract_json_object};
use ethos_memory::Persistence;

const SUMMARIZER_SYSTEM: &str = "You maintain a compact running summary of a conversation \
    between a user and an AI. Merge the latest exchange into the previous memory, keeping \
    durable facts and dropping chit-chat. Reply with the updated summary text only.";

const PROFILE_SYSTEM: &str = "You maintain a long-term profile of a user as a single flat \
    JSON object of stable facts (occupation, goals, preferences). Update it from the latest \
    exchange. Return the new, updated JSON object and nothing else.";

pub struct SummarizerJob {
    pub conversation_id: String,
    pub user_id: String,
    pub prior_summary: String,
    pub user_prompt: String,
    pub final_output: String,
    /// `Some(current profile)` when profile extraction is enabled.
    pub profile_json: Option<String>,
}

pub async fn run(provider: Arc<dyn LlmProvider>, store: Arc<dyn Persistence>, job: SummarizerJob) {
    update_summary(provider.as_ref(), store.as_ref(), &job).await;
    if job.profile_json.is_some() {
        update_profile(provider.as_ref(), store.as_ref(), &job).await;
    }
}

async fn update_summary(provider: &dyn LlmProvider, store: &dyn Persistence, job: &SummarizerJob) {
    let previous =
        if job.prior_summary.is_empty() { "No history." } else { job.prior_summary.as_str() };
    let content = format!(
        "PREVIOUS MEMORY:\n{previous}\n\n\
         LATEST EXCHANGE:\nUser: {}\nAI: {}\n\n\
         UPDATED MEMORY:",
        job.user_prompt, job.final_output,
    );

    match provider.invoke(ROUTE_SUMMARIZER, SUMMARIZER_SYSTEM, &content, CallOverrides::default()).await
    {
        Ok(updated) => {
            let updated = updated.trim();
            if updated.is_empty() {
                return;
            }
            if let Err(err) = store.set_summary(&job.conversation_id, updated).await {
                warn!(error = %err, "failed to persist conversation summary");
            } else {
                debug!(conversation = %job.conversation_id, "conversation summary updated");
            }
        }
        Err(err) => warn!(error = %err, "summarizer call failed"),
    }
}

async fn update_profile(provider: &dyn LlmProvider, store: &dyn Persistence, job: &SummarizerJob) {
    let Some(current) = job.profile_json.as_deref() else {
        return;
    };
    let content = format!(
        "CURRENT_PROFILE_JSON:\n{current}\n\n\
         LATEST_EXCHANGE:\nUser: {}\nAI: {}\n\n\
         Return the new, updated JSON object.",
        job.user_prompt, job.final_output,
    );

    match provider.invoke(ROUTE_SUMMARIZER, PROFILE_SYSTEM, &content, CallOverrides::default()).await {
        Ok(raw) => {
            let Some(profile) = extract_json_object(&raw) else {
                warn!("profile extractor returned no JSON object");
                return;
            };
            if let Err(err) = store.set_user_profile_json(&job.user_id, &profile).await {
                warn!(error = %err, "failed to persist user profile");
            }
        }
        Err(err) => warn!(error = %err, "profile extraction call failed"),
    }
}
