//! Value-governed agent personas and their compilation.
//!
//! An [`AgentProfile`] is the compiled configuration an orchestrator instance
//! serves: a worldview, a style, an ordered value set with scoring rubrics,
//! and the gatekeeper rules. Organizational governance is merged in by the
//! pure [`compile`] function.

pub mod compile;
pub mod norm;
pub mod registry;

pub use compile::{CompileError, compile};
pub use norm::{agent_slug, norm_label};

use serde::{Deserialize, Serialize};

/// Tolerance for the "value weights sum to 1.0" invariant.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// One band of a value's scoring guide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBand {
    pub score: f64,
    pub criteria: String,
}

/// How the conscience judges an answer against one value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rubric {
    pub description: String,
    pub scoring_guide: Vec<ScoreBand>,
}

/// A named ethical dimension with its share of the agent's weight mass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub rubric: Rubric,
}

/// Per-agent model overrides; unset routes fall back to the user's choice,
/// then the system default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub intellect: Option<String>,
    pub will: Option<String>,
    pub conscience: Option<String>,
}

/// A compiled persona. The order of `values` is canonical: it defines the
/// index layout of the agent's spirit memory vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub key: String,
    pub name: String,
    pub description: String,
    pub worldview: String,
    pub style: String,
    pub values: Vec<Value>,
    pub will_rules: Vec<String>,
    #[serde(default)]
    pub models: ModelOverrides,
    /// Template applied to each retrieved chunk, e.g. `"{text_chunk}"`.
    #[serde(default)]
    pub rag_format: Option<String>,
    #[serde(default)]
    pub knowledge_base: Option<String>,
    /// Stamped when an organizational policy was merged in.
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
}

impl AgentProfile {
    /// Canonical value names in spirit-memory order.
    pub fn value_names(&self) -> Vec<String> {
        self.values.iter().map(|v| v.name.clone()).collect()
    }

    pub fn weight_sum(&self) -> f64 {
        self.values.iter().map(|v| v.weight).sum()
    }
}

/// The gatekeeper's verdict on a draft answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WillDecision {
    Approve,
    Violation,
}

impl WillDecision {
    pub fn is_approve(self) -> bool {
        matches!(self, WillDecision::Approve)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WillDecision::Approve => "approve",
            WillDecision::Violation => "violation",
        }
    }
}

/// One value-level evaluation in a turn's conscience ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub value: String,
    /// Rubric score; legal values are {-1, -0.5, 0, 0.5, 1}.
    pub score: f64,
    /// Model confidence in the score, in [0, 1].
    pub confidence: f64,
    pub reason: String,
}

/// Scores the conscience may legally assign.
pub const ALLOWED_SCORES: [f64; 5] = [-1.0, -0.5, 0.0, 0.5, 1.0];

/// An organization-level overlay applied to a base persona at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernancePolicy {
    pub id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    pub global_worldview: String,
    #[serde(default)]
    pub global_will_rules: Vec<String>,
    #[serde(default)]
    pub global_values: Vec<Value>,
}

/// Organization settings that parameterize compilation and the spirit EMA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgSettings {
    /// Weight mass consumed by governance values when compiling agents for
    /// this organization.
    pub governance_split: f64,
    pub spirit_beta: f64,
}

impl Default for OrgSettings {
    fn default() -> Self {
        Self { governance_split: 0.40, spirit_beta: 0.90 }
    }
}
