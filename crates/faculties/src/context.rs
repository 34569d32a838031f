//! Context acquisition for the intellect.
//!
//! Retrieval itself lives outside the core; the pipeline only consumes a
//! formatted context string. Providers never fail a turn: errors degrade to
//! a sentinel string the model can disclose.

use async_trait::async_trait;

/// Returned when retrieval is enabled but found nothing.
pub const NO_DOCUMENTS: &str = "[NO DOCUMENTS FOUND]";

/// Placeholder in format templates replaced by each retrieved chunk.
pub const CHUNK_PLACEHOLDER: &str = "{text_chunk}";

#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Produce the formatted context for `query`.
    ///
    /// Contract: empty string when retrieval is disabled, [`NO_DOCUMENTS`]
    /// when enabled but empty, `"[RAG ERROR: <reason>]"` on failure. Never
    /// an `Err`; a degraded context must not abort the turn.
    async fn get_context(&self, query: &str, format_template: &str) -> String;
}

/// Retrieval switched off.
pub struct DisabledContext;

#[async_trait]
impl ContextProvider for DisabledContext {
    async fn get_context(&self, _query: &str, _format_template: &str) -> String {
        String::new()
    }
}

/// Fixed chunk set, formatted through the template. Useful for plugins that
/// supply their own corpus and for tests.
pub struct StaticContext {
    pub chunks: Vec<String>,
}

#[async_trait]
impl ContextProvider for StaticContext {
    async fn get_context(&self, _query: &str, format_template: &str) -> String {
        if self.chunks.is_empty() {
            return NO_DOCUMENTS.to_string();
        }
        self.chunks
            .iter()
            .map(|chunk| format_template.replace(CHUNK_PLACEHOLDER, chunk))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Supplementary context a tool/plugin hands the intellect for one turn.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    /// Preformatted context substituted directly, bypassing retrieval.
    pub preformatted_context: Option<String>,
    /// Replaces the retrieval query when present.
    pub rag_query_override: Option<String>,
    /// A plugin failure the model should disclose to the user.
    pub plugin_error: Option<String>,
}
