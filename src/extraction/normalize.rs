//! Text sanitization for extracted biomarker names.
//!
//! Lab reports decorate names with footnote markers, parenthetical
//! abbreviations, and typographic digits. All of that is noise for catalog
//! matching, so names are cleaned here right after extraction.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{Biomarker, MarkerKind, PipelineResult};

// Footnote decorations: *, †, ‡, trailing [1] / (2) style references.
static FOOTNOTE_MARKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*†‡]+|\[\d+\]|\(\d+\)$").unwrap());

// "Hemoglobin A1c (HbA1c)" style parenthetical abbreviations.
static PAREN_ABBREV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>[^()]+?)\s*\((?P<abbrev>[^()0-9][^()]*)\)\s*$").unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

// dbSNP reference SNP identifiers, e.g. rs429358.
static RSID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^rs\d+$").unwrap());

const SUBSCRIPTS: [(char, char); 10] = [
    ('₀', '0'),
    ('₁', '1'),
    ('₂', '2'),
    ('₃', '3'),
    ('₄', '4'),
    ('₅', '5'),
    ('₆', '6'),
    ('₇', '7'),
    ('₈', '8'),
    ('₉', '9'),
];

/// A cleaned name plus any abbreviation lifted out of parentheses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedName {
    pub name: String,
    pub extracted_alias: Option<String>,
}

/// Clean one observed name: strip footnote marks, fold typographic digits,
/// collapse whitespace, and lift a parenthetical abbreviation into an alias.
pub fn sanitize_name(raw: &str) -> SanitizedName {
    let mut text: String = raw
        .chars()
        .map(|c| {
            SUBSCRIPTS
                .iter()
                .find(|(sub, _)| *sub == c)
                .map(|(_, ascii)| *ascii)
                .unwrap_or(c)
        })
        .collect();
    text = FOOTNOTE_MARKS.replace_all(&text, "").into_owned();
    text = WHITESPACE.replace_all(text.trim(), " ").into_owned();

    if let Some(caps) = PAREN_ABBREV.captures(&text) {
        let name = caps["name"].trim().to_string();
        let abbrev = caps["abbrev"].trim().to_string();
        if !name.is_empty() && !abbrev.is_empty() {
            return SanitizedName {
                name,
                extracted_alias: Some(abbrev),
            };
        }
    }

    SanitizedName {
        name: text,
        extracted_alias: None,
    }
}

/// Lowercase-alphanumeric fold used for surrogate keys and name comparison.
pub fn normalize_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Classify a marker name: dbSNP rsIDs are genetic, everything else lab.
pub fn classify_marker(name: &str) -> MarkerKind {
    if RSID.is_match(name.trim()) {
        MarkerKind::Genetic
    } else {
        MarkerKind::Lab
    }
}

fn sanitize_biomarker(marker: &mut Biomarker) {
    let cleaned = sanitize_name(&marker.observed_name);
    marker.observed_name = cleaned.name;
    if let Some(alias) = cleaned.extracted_alias {
        if !marker.aliases.iter().any(|a| a == &alias) {
            marker.aliases.push(alias);
        }
    }
    marker.kind = classify_marker(&marker.observed_name);
}

/// Sanitize every biomarker name in an extraction result, in place.
pub fn sanitize_result(result: &mut PipelineResult) {
    for marker in &mut result.biomarkers {
        sanitize_biomarker(marker);
    }
    tracing::debug!(
        biomarkers = result.biomarkers.len(),
        "sanitized extraction result"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footnote_marks_are_stripped() {
        assert_eq!(sanitize_name("Glucose*").name, "Glucose");
        assert_eq!(sanitize_name("Ferritin†").name, "Ferritin");
        assert_eq!(sanitize_name("TSH [2]").name, "TSH");
    }

    #[test]
    fn parenthetical_abbreviation_becomes_alias() {
        let cleaned = sanitize_name("Hemoglobin A1c (HbA1c)");
        assert_eq!(cleaned.name, "Hemoglobin A1c");
        assert_eq!(cleaned.extracted_alias.as_deref(), Some("HbA1c"));
    }

    #[test]
    fn numeric_parenthetical_is_a_footnote_not_an_alias() {
        let cleaned = sanitize_name("Creatinine (2)");
        assert_eq!(cleaned.name, "Creatinine");
        assert_eq!(cleaned.extracted_alias, None);
    }

    #[test]
    fn subscript_digits_fold_to_ascii() {
        assert_eq!(sanitize_name("Vitamin B₁₂").name, "Vitamin B12");
    }

    #[test]
    fn whitespace_collapses() {
        assert_eq!(sanitize_name("  Total \t Cholesterol ").name, "Total Cholesterol");
    }

    #[test]
    fn rsids_classify_as_genetic() {
        assert_eq!(classify_marker("rs429358"), MarkerKind::Genetic);
        assert_eq!(classify_marker("HDL Cholesterol"), MarkerKind::Lab);
        // Prefix alone is not an rsID.
        assert_eq!(classify_marker("rsx99"), MarkerKind::Lab);
    }

    #[test]
    fn normalize_key_folds_case_and_punctuation() {
        assert_eq!(normalize_key("HDL-C"), "hdlc");
        assert_eq!(normalize_key("HDL C"), "hdlc");
        assert_eq!(normalize_key("Vitamin D, 25-OH"), "vitamind25oh");
    }
}
