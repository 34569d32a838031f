//! The agent compiler: merge an optional governance overlay into a base
//! persona and validate the result. Pure and deterministic.

use thiserror::Error;

use crate::norm::{agent_slug, norm_label};
use crate::{AgentProfile, GovernancePolicy, WEIGHT_TOLERANCE};

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("agent '{0}' defines no values")]
    NoValues(String),
    #[error("governance weight {0} is outside [0, 1]")]
    GovernanceWeight(f64),
    #[error("duplicate value name '{0}' after normalization")]
    DuplicateValue(String),
    #[error("compiled value weights sum to {sum}, expected 1.0")]
    WeightSum { sum: f64 },
}

/// Compile a base persona, optionally merging a governance policy.
///
/// With governance present:
/// - the policy worldview is prefixed onto the agent's,
/// - policy rules are prepended to the agent's rules,
/// - policy values are rescaled to sum to `governance_weight` and prepended,
///   while the agent's own values are rescaled to the remaining mass.
///
/// The compiled profile always satisfies: unique normalized value names and
/// a weight sum within [`WEIGHT_TOLERANCE`] of 1.0.
pub fn compile(
    base: &AgentProfile,
    governance: Option<&GovernancePolicy>,
    governance_weight: f64,
) -> Result<AgentProfile, CompileError> {
    if base.values.is_empty() {
        return Err(CompileError::NoValues(base.key.clone()));
    }

    let mut agent = base.clone();
    agent.key = agent_slug(if base.key.is_empty() { &base.name } else { &base.key });

    if let Some(policy) = governance {
        if !(0.0..=1.0).contains(&governance_weight) {
            return Err(CompileError::GovernanceWeight(governance_weight));
        }

        agent.worldview = format!(
            "--- Organizational Policy ---\n{}\n--- Specific Role ---\n{}",
            policy.global_worldview, base.worldview
        );

        let mut rules = policy.global_will_rules.clone();
        rules.extend(base.will_rules.iter().cloned());
        agent.will_rules = rules;

        // Governance values take `governance_weight` of the mass; the
        // agent's own values are squeezed into the remainder.
        let gov_sum: f64 = policy.global_values.iter().map(|v| v.weight).sum();
        let base_sum: f64 = base.values.iter().map(|v| v.weight).sum();
        let remaining = 1.0 - governance_weight;

        let mut values = Vec::with_capacity(policy.global_values.len() + base.values.len());
        for value in &policy.global_values {
            let mut scaled = value.clone();
            scaled.weight = if gov_sum > 0.0 {
                value.weight * governance_weight / gov_sum
            } else {
                0.0
            };
            values.push(scaled);
        }
        for value in &base.values {
            let mut scaled = value.clone();
            scaled.weight = if base_sum > 0.0 { value.weight * remaining / base_sum } else { 0.0 };
            values.push(scaled);
        }
        agent.values = values;

        agent.policy_id = Some(policy.id.clone());
        if agent.org_id.is_none() {
            agent.org_id = policy.org_id.clone();
        }
    }

    let mut seen = std::collections::HashSet::new();
    for value in &agent.values {
        if !seen.insert(norm_label(&value.name)) {
            return Err(CompileError::DuplicateValue(value.name.clone()));
        }
    }

    let sum = agent.weight_sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(CompileError::WeightSum { sum });
    }

    Ok(agent)
}
