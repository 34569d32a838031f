//! Resilient extraction of structured output from free-form model text.
//!
//! This module is the only place that knows how to parse the raw, messy and
//! unreliable string/JSON shapes different models produce. All three parsers
//! are pure: same input, same output, no side effects, never a panic.

use regex::Regex;
use serde_json::Value;

pub use ethos_agent::{ALLOWED_SCORES, LedgerEntry, WillDecision};

/// Delimiter the intellect route is instructed to place between its answer
/// and its reflection JSON.
pub const REFLECTION_DELIMITER: &str = "---REFLECTION---";

/// Reflection text used when the model output carried no parsable structure.
pub const SALVAGED_REFLECTION: &str = "Salvaged raw output; model failed to format.";

// ─── robust JSON recovery ────────────────────────────────────────────────────

/// Slice out the body of the first fenced code block, if any.
fn fenced_body(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after = &raw[start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Parse the first JSON object found in `raw`, tolerating code fences,
/// surrounding prose, trailing commas and stray whitespace.
pub(crate) fn robust_json_object(raw: &str) -> Option<Value> {
    robust_json(raw, '{', '}').filter(Value::is_object)
}

/// Like [`robust_json_object`] but also accepts a bare top-level array.
///
/// Whichever structural character appears first decides which shape to try
/// first; a bare array of objects must not be mistaken for its first element.
fn robust_json_loose(raw: &str) -> Option<Value> {
    let text = fenced_body(raw).unwrap_or(raw);
    let array_first = match (text.find('['), text.find('{')) {
        (Some(a), Some(o)) => a < o,
        (Some(_), None) => true,
        _ => false,
    };

    let as_object = || robust_json(raw, '{', '}').filter(Value::is_object);
    let as_array = || robust_json(raw, '[', ']').filter(Value::is_array);
    if array_first {
        as_array().or_else(as_object)
    } else {
        as_object().or_else(as_array)
    }
}

fn robust_json(raw: &str, open: char, close: char) -> Option<Value> {
    let candidates = [fenced_body(raw), Some(raw)];
    for candidate in candidates.into_iter().flatten() {
        let slice = match (candidate.find(open), candidate.rfind(close)) {
            (Some(start), Some(end)) if end > start => &candidate[start..=end],
            _ => continue,
        };

        if let Ok(value) = serde_json::from_str::<Value>(slice) {
            return Some(value);
        }

        // Sanitize the common failure modes and retry: newlines inside
        // strings the model forgot to escape, trailing commas, run-on
        // whitespace.
        let mut sanitized = slice.replace(['\r', '\n'], " ");
        let trailing_comma = Regex::new(r",\s*([}\]])").ok()?;
        sanitized = trailing_comma.replace_all(&sanitized, "$1").into_owned();
        let runs = Regex::new(r"\s{2,}").ok()?;
        sanitized = runs.replace_all(&sanitized, " ").trim().to_string();

        if let Ok(value) = serde_json::from_str::<Value>(&sanitized) {
            return Some(value);
        }
    }
    None
}

/// Case-insensitive key lookup on a JSON object.
fn get_ci<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    let map = obj.as_object()?;
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Render a reflection value as text. Some models nest an object or array
/// under the key; those are re-serialized rather than discarded.
fn reflection_text(value: Option<&Value>, fallback: &str) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(v @ (Value::Object(_) | Value::Array(_))) => v.to_string(),
        Some(Value::Null) | None => fallback.to_string(),
        Some(other) => other.to_string(),
    }
}

fn unescape_newlines(s: &str) -> String {
    s.replace("\\n", "\n")
}

// ─── intellect ───────────────────────────────────────────────────────────────

/// Split an intellect reply into `(answer, reflection)`.
///
/// Strategy order: explicit `---REFLECTION---` delimiter, then a fenced JSON
/// block carrying a `reflection` key, then a reverse brace search for an
/// embedded object with that key, then salvage (the whole text becomes the
/// answer and the reflection is a fixed sentinel).
pub fn parse_intellect(raw: &str) -> (String, String) {
    let mut answer;
    let reflection;

    if let Some(pos) = raw.find(REFLECTION_DELIMITER) {
        answer = raw[..pos].trim().to_string();
        let tail = &raw[pos + REFLECTION_DELIMITER.len()..];
        let obj = robust_json_object(tail);
        reflection = reflection_text(
            obj.as_ref().and_then(|o| get_ci(o, "reflection")),
            "Parsed reflection from delimiter.",
        );
    } else if let Some((body_start, obj)) = find_reflection_object(raw) {
        answer = raw[..body_start].trim().to_string();
        reflection = reflection_text(get_ci(&obj, "reflection"), "Parsed reflection from embedded JSON.");
        if answer.is_empty() {
            answer = "[Answer missing, model only sent JSON]".to_string();
        }
    } else {
        answer = raw.trim().to_string();
        reflection = SALVAGED_REFLECTION.to_string();
    }

    if answer.trim().is_empty() {
        return (
            "[Model returned an empty answer]".to_string(),
            "Model returned empty answer.".to_string(),
        );
    }

    (unescape_newlines(&answer), unescape_newlines(&reflection))
}

/// Locate a JSON object containing a `reflection` key in the tail of the
/// text. Returns the byte offset where the object (or its fence) begins.
fn find_reflection_object(raw: &str) -> Option<(usize, Value)> {
    // Prefer a fenced block: its start offset cleanly separates prose from
    // structure.
    if let Some(fence_start) = raw.find("```") {
        if let Some(obj) = fenced_body(raw).and_then(robust_json_object) {
            if get_ci(&obj, "reflection").is_some() {
                return Some((fence_start, obj));
            }
        }
    }

    let start = raw.find('{')?;
    let obj = robust_json_object(&raw[start..])?;
    if get_ci(&obj, "reflection").is_some() {
        return Some((start, obj));
    }
    None
}

// ─── will ────────────────────────────────────────────────────────────────────

/// Parse a will reply into `(decision, reason)`.
///
/// Every ambiguous shape resolves to `Violation`: an unreviewable verdict
/// must not let a draft through.
pub fn parse_will(raw: &str) -> (WillDecision, String) {
    if let Some(obj) = robust_json_object(raw) {
        let decision_txt = get_ci(&obj, "decision")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let reason = get_ci(&obj, "reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let decision = if decision_txt == "approve" {
            WillDecision::Approve
        } else {
            WillDecision::Violation
        };
        let reason = if reason.is_empty() {
            "Decision explained by Will policies and the active value set.".to_string()
        } else {
            reason
        };
        return (decision, reason);
    }

    // JSON recovery failed; scan for labeled fields in plain text.
    if let Some((decision, reason)) = scan_labeled_verdict(raw) {
        return (decision, reason);
    }

    // Last resort: keyword heuristic over the whole text.
    let lower = raw.to_lowercase();
    if lower.contains("violation") || lower.contains("block") {
        (WillDecision::Violation, "Keyword heuristic matched a violation verdict.".to_string())
    } else if lower.contains("approve") {
        (WillDecision::Approve, "Keyword heuristic matched an approval verdict.".to_string())
    } else {
        (
            WillDecision::Violation,
            "Internal evaluation error (unparsable verdict)".to_string(),
        )
    }
}

fn scan_labeled_verdict(raw: &str) -> Option<(WillDecision, String)> {
    let decision_re = Regex::new(r#"(?i)decision["'\s]*[:=]["'\s]*([a-z]+)"#).ok()?;
    let word = decision_re.captures(raw)?.get(1)?.as_str().to_lowercase();

    let decision = if word == "approve" { WillDecision::Approve } else { WillDecision::Violation };

    let reason_re = Regex::new(r#"(?i)reason["'\s]*[:=]\s*"([^"]*)""#).ok()?;
    let reason = reason_re
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "Decision explained by Will policies and the active value set.".to_string());

    Some((decision, reason))
}

// ─── conscience ──────────────────────────────────────────────────────────────

/// Parse a conscience reply into a ledger.
///
/// Accepts `{"evaluations": [...]}` or a bare array. When nothing parsable
/// is found, returns a single error record; the spirit integrator then sees
/// every canonical value as missing and leaves memory untouched.
pub fn parse_conscience(raw: &str) -> Vec<LedgerEntry> {
    let Some(value) = robust_json_loose(raw) else {
        return vec![parse_error_entry()];
    };

    let rows = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(_) => match get_ci(&value, "evaluations") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return vec![parse_error_entry()],
        },
        _ => return vec![parse_error_entry()],
    };

    rows.iter().filter_map(coerce_entry).collect()
}

fn parse_error_entry() -> LedgerEntry {
    LedgerEntry {
        value: "parse-error".to_string(),
        score: 0.0,
        confidence: 0.0,
        reason: "Internal evaluation error (JSON parse failed)".to_string(),
    }
}

fn coerce_entry(row: &Value) -> Option<LedgerEntry> {
    let obj = row.as_object()?;
    let value = obj.get("value").or_else(|| obj.get("name"))?.as_str()?.to_string();

    let score = numeric(obj.get("score")).unwrap_or(0.0);
    let confidence = numeric(obj.get("confidence")).unwrap_or(0.0);
    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(LedgerEntry {
        value,
        score: snap_score(score),
        confidence: confidence.clamp(0.0, 1.0),
        reason,
    })
}

/// Coerce a JSON number or numeric string; NaN becomes 0.
fn numeric(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if n.is_nan() { Some(0.0) } else { Some(n) }
}

// ─── suggestions & profile extraction ────────────────────────────────────────

/// Parse a `{"suggestions": ["...", ...]}` reply from the suggestions route.
/// Anything unparsable yields an empty list; suggestions are best-effort.
pub fn parse_suggestions(raw: &str) -> Vec<String> {
    let Some(obj) = robust_json_object(raw) else {
        return Vec::new();
    };
    match get_ci(&obj, "suggestions") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Extract a JSON object from free text, e.g. a rewritten user-profile
/// document. Returns the compact re-serialization.
pub fn extract_json_object(raw: &str) -> Option<String> {
    robust_json_object(raw).map(|obj| obj.to_string())
}

/// Snap a score to the nearest rubric-allowed value.
pub fn snap_score(score: f64) -> f64 {
    let mut best = ALLOWED_SCORES[0];
    let mut best_dist = f64::MAX;
    for candidate in ALLOWED_SCORES {
        let dist = (score - candidate).abs();
        if dist < best_dist {
            best = candidate;
            best_dist = dist;
        }
    }
    best
}
