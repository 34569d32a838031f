//! The four faculties of a governed turn.
//!
//! Intellect generates, Will gates, Conscience scores, Spirit integrates.
//! The first two run synchronously inside the turn; the last two run in the
//! background audit after the caller already has the answer.

pub mod conscience;
pub mod context;
pub mod feedback;
pub mod intellect;
pub mod spirit;
pub mod will;

pub use conscience::{ConscienceAuditor, SHORT_INTERACTION_LIMIT};
pub use context::{
    CHUNK_PLACEHOLDER, ContextProvider, DisabledContext, NO_DOCUMENTS, PluginContext,
    StaticContext,
};
pub use feedback::{DRIFT_BANDS, TREND_WINDOW, build_spirit_feedback};
pub use intellect::{Draft, GenerationInputs, IntellectEngine, assemble_reply};
pub use spirit::{SpiritIntegrator, SpiritUpdate};
pub use will::{FAIL_CLOSED_REASON, MISSING_REASON, WillGate};
