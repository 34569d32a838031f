//! Prompt suggestions over the `suggestions` route.
//!
//! Two flavors: follow-up questions after an approved answer, and compliant
//! rephrasings after a blocked one. Both are best-effort; any failure
//! returns an empty list.

use tracing::warn;

use ethos_llm::{CallOverrides, LlmProvider, ROUTE_SUGGESTIONS, parse_suggestions};

const FOLLOW_UP_SYSTEM: &str = "You suggest three short follow-up questions a curious user \
    might ask next. Keep each under fifteen words. \
    Return JSON: {\"suggestions\": [\"...\", \"...\", \"...\"]}.";

const REPHRASE_SYSTEM: &str = "A user's prompt was blocked by policy. Suggest up to three \
    rephrasings that pursue the user's legitimate interest without violating the rules. \
    Return JSON: {\"suggestions\": [\"...\"]}.";

pub async fn follow_up_suggestions(
    provider: &dyn LlmProvider,
    user_prompt: &str,
    ai_response: &str,
) -> Vec<String> {
    let content = format!(
        "Here is the user's prompt:\n{user_prompt}\n\n\
         Here is the AI's answer:\n{ai_response}\n\n\
         Please provide relevant follow-up questions."
    );
    request(provider, FOLLOW_UP_SYSTEM, &content).await
}

pub async fn compliant_rephrasings(
    provider: &dyn LlmProvider,
    user_prompt: &str,
    rules: &[String],
) -> Vec<String> {
    let rules_block = rules.iter().map(|r| format!("- {r}")).collect::<Vec<_>>().join("\n");
    let content = format!(
        "Here are the rules in force:\n{rules_block}\n\n\
         Here is the user's original (blocked) prompt:\n{user_prompt}\n\n\
         Please provide compliant suggestions."
    );
    request(provider, REPHRASE_SYSTEM, &content).await
}

async fn request(provider: &dyn LlmProvider, system: &str, content: &str) -> Vec<String> {
    match provider.invoke(ROUTE_SUGGESTIONS, system, content, CallOverrides::default()).await {
        Ok(raw) => parse_suggestions(&raw),
        Err(err) => {
            warn!(error = %err, "suggestion generation failed");
            Vec::new()
        }
    }
}
