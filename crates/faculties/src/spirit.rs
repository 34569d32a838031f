//! The integrating faculty.
//!
//! Spirit folds each turn's conscience ledger into the agent's long-term
//! alignment vector `mu` with an exponential moving average, and reports a
//! 1–10 coherence score plus the cosine drift between this turn's
//! observation and the established memory.

use std::collections::HashMap;

use ethos_agent::{LedgerEntry, Value, norm_label};

/// Everything one spirit computation yields.
#[derive(Debug, Clone, PartialEq)]
pub struct SpiritUpdate {
    /// Coherence of this turn, in 1..=10.
    pub spirit_score: u8,
    pub note: String,
    pub mu_new: Vec<f64>,
    /// This turn's raw alignment observation, `weight_i * score_i`.
    pub p_t: Vec<f64>,
    /// `1 - cos(p_t, mu_prev)`; `None` when either vector has zero norm.
    pub drift: Option<f64>,
    /// False when the ledger was empty or missing canonical values; the
    /// memory was left untouched in that case.
    pub ledger_complete: bool,
}

pub struct SpiritIntegrator {
    weights: Vec<f64>,
    names: Vec<String>,
    norm_index: HashMap<String, usize>,
    beta: f64,
}

impl SpiritIntegrator {
    pub fn new(values: &[Value], beta: f64) -> Self {
        let weights = values.iter().map(|v| v.weight).collect();
        let names: Vec<String> = values.iter().map(|v| v.name.clone()).collect();
        let norm_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (norm_label(name), i))
            .collect();
        Self { weights, names, norm_index, beta }
    }

    pub fn dim(&self) -> usize {
        self.weights.len()
    }

    /// Integrate one ledger into the memory vector.
    ///
    /// An empty ledger (short interaction, conscience failure) and a ledger
    /// missing any canonical value both leave `mu` unchanged; the latter is
    /// called out by name in the note so it is visible in the turn log.
    pub fn compute(&self, ledger: &[LedgerEntry], mu_prev: &[f64]) -> SpiritUpdate {
        let dim = self.dim();
        let zeros = vec![0.0; dim];
        let mu_prev: Vec<f64> =
            if mu_prev.len() == dim { mu_prev.to_vec() } else { zeros.clone() };

        if dim == 0 || ledger.is_empty() {
            return SpiritUpdate {
                spirit_score: 1,
                note: "Coherence 1/10, drift 0.00.".to_string(),
                mu_new: mu_prev,
                p_t: zeros,
                drift: None,
                ledger_complete: false,
            };
        }

        // Align ledger rows to the canonical value order by normalized name.
        let by_name: HashMap<String, &LedgerEntry> =
            ledger.iter().map(|row| (norm_label(&row.value), row)).collect();
        let aligned: Vec<Option<&LedgerEntry>> = self
            .names
            .iter()
            .map(|name| by_name.get(&norm_label(name)).copied())
            .collect();

        let missing: Vec<&str> = aligned
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_none())
            .map(|(i, _)| self.names[i].as_str())
            .collect();
        if !missing.is_empty() {
            return SpiritUpdate {
                spirit_score: 1,
                note: format!("Ledger missing: {}", missing.join(", ")),
                mu_new: mu_prev,
                p_t: zeros,
                drift: None,
                ledger_complete: false,
            };
        }

        // No gaps past this point; flatten drops nothing.
        let rows: Vec<&LedgerEntry> = aligned.into_iter().flatten().collect();
        let coerce = |x: f64| if x.is_nan() { 0.0 } else { x };
        let scores: Vec<f64> = rows.iter().map(|r| coerce(r.score)).collect();
        let confidences: Vec<f64> = rows.iter().map(|r| coerce(r.confidence)).collect();

        let raw: f64 = self
            .weights
            .iter()
            .zip(&scores)
            .zip(&confidences)
            .map(|((w, s), c)| w * s * c)
            .sum::<f64>()
            .clamp(-1.0, 1.0);
        let spirit_score = (((raw + 1.0) / 2.0) * 9.0 + 1.0).round() as u8;

        let p_t: Vec<f64> = self.weights.iter().zip(&scores).map(|(w, s)| w * s).collect();
        let mu_new: Vec<f64> = mu_prev
            .iter()
            .zip(&p_t)
            .map(|(prev, p)| self.beta * prev + (1.0 - self.beta) * p)
            .collect();

        let drift = cosine_drift(&p_t, &mu_prev);
        let note = format!("Coherence {spirit_score}/10, drift {:.2}.", drift.unwrap_or(0.0));

        SpiritUpdate { spirit_score, note, mu_new, p_t, drift, ledger_complete: true }
    }
}

/// `1 - cos(a, b)`, or `None` when either norm is (near) zero.
fn cosine_drift(a: &[f64], b: &[f64]) -> Option<f64> {
    const EPS: f64 = 1e-8;
    let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
    let denom = norm(a) * norm(b);
    if denom < EPS {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Some(1.0 - dot / denom)
}
