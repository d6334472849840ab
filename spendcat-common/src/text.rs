//! Text normalization for procurement descriptions
//!
//! Two strengths are provided:
//! - [`fold`] lower-cases, strips accents and punctuation, and collapses
//!   whitespace. Column headers are compared on this form.
//! - [`normalize`] additionally expands abbreviations and drops noise words.
//!   Descriptions, keyword terms and model vocabulary all use this form.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Abbreviations expanded by [`normalize`]
const ABBREVIATIONS: &[(&str, &str)] = &[("etiq", "etiqueta")];

/// Articles and prepositions removed by [`normalize`]
const NOISE_WORDS: &[&str] = &[
    "para", "com", "de", "do", "da", "em", "no", "na", "a", "o", "as", "os",
];

/// Lower-case, strip accents, replace punctuation with spaces, collapse runs
/// of whitespace
pub fn fold(s: &str) -> String {
    let lowered = s.to_lowercase();
    let mut out = String::with_capacity(lowered.len());

    for ch in lowered.nfd() {
        if is_combining_mark(ch) {
            continue;
        }
        // `_` is a word character; everything else, hyphen included, separates.
        if ch.is_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push(' ');
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// [`fold`] plus abbreviation expansion and noise-word removal
pub fn normalize(s: &str) -> String {
    fold(s)
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == w)
                .map(|(_, full)| *full)
                .unwrap_or(w)
        })
        .filter(|w| !NOISE_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive comparison key (trimmed, lower-cased; accents kept)
pub fn key(s: &str) -> String {
    s.trim().to_lowercase()
}
