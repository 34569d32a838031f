//! Name normalization for value matching and cache keys.
//!
//! Value names come back from an LLM, so matching must survive Unicode
//! variants, dash flavors, casing, and stray whitespace.

use unicode_normalization::UnicodeNormalization;

/// Dash characters folded to a plain hyphen: hyphen, non-breaking hyphen,
/// figure dash, en dash, em dash, minus sign.
const DASHES: [char; 6] = [
    '\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2212}',
];

/// Normalize a label for safe matching: NFKC, dash folding, whitespace
/// collapse, lowercase.
pub fn norm_label(s: &str) -> String {
    let folded: String = s
        .nfkc()
        .map(|c| if DASHES.contains(&c) { '-' } else { c })
        .collect();
    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalize an agent name into the parsable cache-key prefix: lowercase,
/// spaces to underscores, everything but alphanumerics and underscores
/// dropped.
pub fn agent_slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}
