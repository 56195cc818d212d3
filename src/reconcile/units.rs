//! Unit normalization.
//!
//! Lab reports spell the same unit a dozen ways (MG/DL, mg/dl, mg/dL). We
//! fold known spellings onto one canonical form so `(catalog_id, unit)`
//! keys line up across documents. Unknown-but-plausible units pass through
//! unchanged; garbage is rejected.

/// Canonical spellings, matched case-insensitively.
const CANONICAL_UNITS: &[(&str, &str)] = &[
    ("mg/dl", "mg/dL"),
    ("g/dl", "g/dL"),
    ("ng/dl", "ng/dL"),
    ("ug/dl", "µg/dL"),
    ("µg/dl", "µg/dL"),
    ("mcg/dl", "µg/dL"),
    ("pg/ml", "pg/mL"),
    ("ng/ml", "ng/mL"),
    ("ug/ml", "µg/mL"),
    ("µg/ml", "µg/mL"),
    ("mcg/ml", "µg/mL"),
    ("miu/l", "mIU/L"),
    ("uiu/ml", "µIU/mL"),
    ("µiu/ml", "µIU/mL"),
    ("mmol/l", "mmol/L"),
    ("umol/l", "µmol/L"),
    ("µmol/l", "µmol/L"),
    ("nmol/l", "nmol/L"),
    ("pmol/l", "pmol/L"),
    ("meq/l", "mEq/L"),
    ("iu/l", "IU/L"),
    ("u/l", "U/L"),
    ("k/ul", "K/µL"),
    ("k/µl", "K/µL"),
    ("10^3/ul", "K/µL"),
    ("m/ul", "M/µL"),
    ("m/µl", "M/µL"),
    ("10^6/ul", "M/µL"),
    ("cells/ul", "cells/µL"),
    ("fl", "fL"),
    ("pg", "pg"),
    ("%", "%"),
    ("ratio", "ratio"),
    ("mm/hr", "mm/hr"),
    ("sec", "sec"),
];

/// Normalize one unit string.
///
/// Returns `None` when the unit is absent or malformed. A unit the table
/// does not know is kept verbatim, since rejecting it would force a false
/// unit identity on the observation.
pub fn canonical_unit(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Reject strings that cannot be a unit: control chars or no
    // alphanumeric/percent content at all.
    if trimmed.chars().any(char::is_control) {
        return None;
    }
    if !trimmed.chars().any(|c| c.is_alphanumeric() || c == '%') {
        return None;
    }

    let folded = trimmed.to_lowercase();
    for (spelling, canonical) in CANONICAL_UNITS {
        if folded == *spelling {
            return Some((*canonical).to_string());
        }
    }
    Some(trimmed.to_string())
}
