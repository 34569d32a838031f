//! The generative faculty.
//!
//! Intellect owns prompt assembly: it folds the persona worldview, retrieved
//! context, conversation summary, user identity, and the previous turn's
//! spirit feedback into one system prompt, then delegates the model call.
//! Assembly is deterministic for fixed inputs; the will cache depends on
//! that.

use std::sync::Arc;

use tracing::{debug, warn};

use ethos_agent::AgentProfile;
use ethos_llm::{LlmProvider, ProviderError, REFLECTION_DELIMITER};

use crate::context::{CHUNK_PLACEHOLDER, ContextProvider, NO_DOCUMENTS, PluginContext};

const WORLDVIEW_CONTEXT_SLOT: &str = "{retrieved_context}";

const FORMAT_INSTRUCTIONS: &str = "RESPONSE FORMAT:\n\
    Write your answer for the user, then on a new line write the delimiter\n\
    ---REFLECTION---\n\
    followed by a JSON object of the form {\"reflection\": \"<one or two sentences on how you \
    approached this answer>\"}. Nothing may follow the JSON object.\n\n\
    STYLE:\n{persona_style_rules}";

/// What one generation produced, plus the exact context string the
/// conscience must audit against.
#[derive(Debug, Clone)]
pub struct Draft {
    pub answer: String,
    pub reflection: String,
    pub context_for_audit: String,
}

/// Turn-scoped inputs gathered by the orchestrator before generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationInputs {
    pub user_prompt: String,
    pub memory_summary: String,
    pub spirit_feedback: String,
    pub user_profile_json: String,
    pub user_name: Option<String>,
    pub plugin: Option<PluginContext>,
}

pub struct IntellectEngine {
    provider: Arc<dyn LlmProvider>,
    context: Arc<dyn ContextProvider>,
    profile: Arc<AgentProfile>,
}

impl IntellectEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        context: Arc<dyn ContextProvider>,
        profile: Arc<AgentProfile>,
    ) -> Self {
        Self { provider, context, profile }
    }

    /// Generate `(answer, reflection)` for the turn. `corrective` carries the
    /// gatekeeper's reason during a reflexion retry.
    pub async fn generate(
        &self,
        inputs: &GenerationInputs,
        corrective: Option<&str>,
    ) -> Result<Draft, ProviderError> {
        let context_for_audit = self.assemble_context(inputs).await;
        let system_prompt = self.assemble_system_prompt(inputs, &context_for_audit, corrective);

        match self.provider.run_intellect(&system_prompt, &inputs.user_prompt).await {
            Ok((answer, reflection)) => {
                debug!(answer_len = answer.len(), "intellect draft produced");
                Ok(Draft { answer, reflection, context_for_audit })
            }
            Err(err) => {
                warn!(error = %err, "intellect generation failed");
                Err(err)
            }
        }
    }

    /// Fetch and merge plugin + retrieved context. The merged string is both
    /// injected into the worldview and preserved verbatim for the audit.
    async fn assemble_context(&self, inputs: &GenerationInputs) -> String {
        let query = inputs
            .plugin
            .as_ref()
            .and_then(|p| p.rag_query_override.as_deref())
            .unwrap_or(&inputs.user_prompt);
        let format = self.profile.rag_format.as_deref().unwrap_or(CHUNK_PLACEHOLDER);
        let retrieved = self.context.get_context(query, format).await;

        let mut plugin_block = String::new();
        if let Some(plugin) = &inputs.plugin {
            if let Some(error) = &plugin.plugin_error {
                plugin_block.push_str(&format!(
                    "CONTEXT: A data plugin failed while fetching information for the user.\n\
                     Error message: {error}\n\
                     Disclose this failure to the user in plain terms.\n\n"
                ));
            }
            if let Some(preformatted) = &plugin.preformatted_context {
                plugin_block.push_str(preformatted);
            }
        }

        join_nonempty(&[plugin_block.trim_end(), retrieved.as_str()], "\n\n")
    }

    fn assemble_system_prompt(
        &self,
        inputs: &GenerationInputs,
        full_context: &str,
        corrective: Option<&str>,
    ) -> String {
        let mut worldview = self.profile.worldview.clone();
        if worldview.contains(WORLDVIEW_CONTEXT_SLOT) {
            let injected = if full_context.is_empty() { NO_DOCUMENTS } else { full_context };
            worldview = worldview.replace(WORLDVIEW_CONTEXT_SLOT, injected);
        }

        let user_name_block = inputs.user_name.as_deref().map(|name| {
            format!(
                "CONTEXT: You are speaking to a user named {name}. Use their name when it \
                 feels natural."
            )
        });

        let profile_block = (!inputs.user_profile_json.is_empty()
            && inputs.user_profile_json != "{}")
            .then(|| {
                format!(
                    "CONTEXT: Here is the user's profile. Use these facts to tailor your \
                     examples.\n<user_profile>{}</user_profile>",
                    inputs.user_profile_json
                )
            });

        let summary_block = (!inputs.memory_summary.is_empty()).then(|| {
            format!(
                "CONTEXT: Here is a summary of our conversation so far. Use it to inform \
                 your answer.\n<summary>{}</summary>",
                inputs.memory_summary
            )
        });

        let spirit_block = (!inputs.spirit_feedback.is_empty()).then(|| {
            format!(
                "COACHING NOTE: Your long-term alignment monitor left you this feedback \
                 after the previous turn. Let it quietly shape this answer.\n{}",
                inputs.spirit_feedback
            )
        });

        let corrective_block = corrective.map(|reason| {
            format!(
                "CORRECTIVE DIRECTIVE: Your previous draft was rejected by the ethical \
                 gatekeeper for this reason: {reason}\n\
                 Produce a revised answer that resolves the objection while still helping \
                 the user."
            )
        });

        let formatting = FORMAT_INSTRUCTIONS.replace("{persona_style_rules}", &self.profile.style);

        let blocks: Vec<&str> = [
            Some(worldview.as_str()),
            user_name_block.as_deref(),
            profile_block.as_deref(),
            summary_block.as_deref(),
            spirit_block.as_deref(),
            corrective_block.as_deref(),
            Some(formatting.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect();

        blocks.join("\n\n")
    }
}

/// Reconstruct the canonical delimiter shape from its parts. The inverse of
/// `parse_intellect` for well-formed drafts; used by tests and the turn
/// ledger.
pub fn assemble_reply(answer: &str, reflection: &str) -> String {
    format!(
        "{answer}\n{REFLECTION_DELIMITER}\n{}",
        serde_json::json!({ "reflection": reflection })
    )
}

fn join_nonempty(parts: &[&str], separator: &str) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(separator)
}
