//! The spirit feedback seed.
//!
//! A pure function of the current memory vector: two lines of text the next
//! turn's intellect receives as a coaching note. No model calls.

/// Drift thresholds for the none / slight / moderate / high labels.
pub const DRIFT_BANDS: (f64, f64, f64) = (0.10, 0.20, 0.40);

/// Minimum number of recent mu samples before trend tags are emitted.
pub const TREND_WINDOW: usize = 3;

const SLOPE_TOLERANCE: f64 = 1e-3;

/// Build the two-line feedback seed.
///
/// `recent_mu` is optional history, oldest first; trend tags appear only
/// when at least [`TREND_WINDOW`] samples are available. Returns an empty
/// string when `mu` and `value_names` do not align (nothing useful can be
/// said).
pub fn build_spirit_feedback(
    mu: &[f64],
    value_names: &[String],
    drift: f64,
    recent_mu: Option<&[Vec<f64>]>,
) -> String {
    if mu.is_empty() || mu.len() != value_names.len() {
        return String::new();
    }

    let (top_i, low_i) = extremes(mu);
    let (top_name, low_name) = (&value_names[top_i], &value_names[low_i]);
    let (top_score, low_score) = (mu[top_i], mu[low_i]);

    let drift_label = label_drift(drift);
    let header = format!(
        "Spirit state, Top={top_name}({top_score:.2}), Low={low_name}({low_score:.2}), \
         Drift={drift:.2}({drift_label})"
    );

    let top_trend = recent_mu.and_then(|h| trend_label(slope_for(h, top_i)));
    let low_trend = recent_mu.and_then(|h| trend_label(slope_for(h, low_i)));

    let mut parts: Vec<String> = Vec::new();
    if top_score > 0.1 {
        parts.push(format!("You are strong on {top_name}"));
        if let Some(trend) = top_trend {
            parts.push(format!("which is {trend}"));
        }
    }
    if low_score < 0.5 {
        parts.push(format!("Focus more on {low_name}"));
        if let Some(trend) = low_trend {
            parts.push(format!("which is {trend}"));
        }
    }
    if matches!(drift_label, "moderate" | "high") {
        parts.push("Correct course this turn".to_string());
    }

    let mut note = parts.join(". ");
    if !note.is_empty() {
        note.push('.');
    }

    format!("{header}\nFeedback: {note}")
}

fn extremes(mu: &[f64]) -> (usize, usize) {
    let mut top = 0;
    let mut low = 0;
    for (i, value) in mu.iter().enumerate() {
        if *value > mu[top] {
            top = i;
        }
        if *value < mu[low] {
            low = i;
        }
    }
    (top, low)
}

fn label_drift(drift: f64) -> &'static str {
    let (none, slight, moderate) = DRIFT_BANDS;
    if drift < none {
        "none"
    } else if drift < slight {
        "slight"
    } else if drift < moderate {
        "moderate"
    } else {
        "high"
    }
}

/// Least-squares slope of one dimension over the trailing window, or `None`
/// when the history is too short.
fn slope_for(history: &[Vec<f64>], idx: usize) -> Option<f64> {
    if history.len() < TREND_WINDOW {
        return None;
    }
    let series: Vec<f64> = history[history.len() - TREND_WINDOW..]
        .iter()
        .filter_map(|mu| mu.get(idx).copied())
        .collect();
    if series.len() < 2 {
        return None;
    }

    let n = series.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = series.iter().sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }
    if denominator == 0.0 { None } else { Some(numerator / denominator) }
}

fn trend_label(slope: Option<f64>) -> Option<&'static str> {
    let slope = slope?;
    if slope > SLOPE_TOLERANCE {
        Some("rising")
    } else if slope < -SLOPE_TOLERANCE {
        Some("falling")
    } else {
        Some("flat")
    }
}
