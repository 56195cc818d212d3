//! Graph node records: the Instance/Type split.
//!
//! Instance nodes (`DocumentReference`, observation values) always carry a
//! `patient_id`. Type nodes (`ObservationTypeNode`) are tenant-shared
//! ontology records and carry none — they are reachable only by traversing
//! from an Instance node, which the store layer enforces structurally.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::biomarker::ObservedValue;
use super::catalog::RangeStatus;

/// Mandatory patient anchor for every read against the graph.
///
/// Every read method on the store takes this by reference — there is no way
/// to scan Type nodes without naming a patient first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientScope {
    pub patient_id: String,
    pub user_id: String,
}

impl PatientScope {
    pub fn new(patient_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Per-upload Instance node. Created once at reconciliation-commit time and
/// immutable afterwards except for soft delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReference {
    pub uuid: Uuid,
    pub patient_id: String,
    pub user_id: String,
    pub document_name: String,
    /// Content hash of the source bytes; identical re-uploads share it.
    pub source_hash: String,
    pub report_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

/// Identity of a Type node. `(catalog_id, unit)` identifies at most one
/// `ObservationTypeNode`; unvalidated markers use a `raw:<name>` surrogate
/// id so repeats of the same unknown marker still collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationTypeKey {
    pub catalog_id: String,
    pub unit: String,
}

impl ObservationTypeKey {
    pub fn resolved(catalog_id: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            unit: unit.into(),
        }
    }

    /// Surrogate key for a marker with no catalog match.
    pub fn unvalidated(normalized_name: &str, unit: impl Into<String>) -> Self {
        Self {
            catalog_id: format!("raw:{normalized_name}"),
            unit: unit.into(),
        }
    }

    /// Whether this key points at a real catalog entry.
    pub fn is_validated(&self) -> bool {
        !self.catalog_id.starts_with("raw:")
    }

    /// The catalog id, if any (surrogate keys yield `None`).
    pub fn catalog_id(&self) -> Option<&str> {
        if self.is_validated() {
            Some(&self.catalog_id)
        } else {
            None
        }
    }
}

/// Attributes written onto a Type node at get-or-create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationTypeAttrs {
    pub key: ObservationTypeKey,
    pub canonical_name: String,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// False when the marker had no confident catalog match.
    pub validated: bool,
}

/// One observation value ready for commit, before graph identity is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationValueDraft {
    pub value: ObservedValue,
    pub unit: String,
    pub observed_at: Option<NaiveDate>,
    pub status: Option<RangeStatus>,
}

impl ObservationValueDraft {
    /// Deduplication key within one `(type, patient)`: equal value, unit and
    /// observation date collapse to one node.
    pub fn dedup_key(&self) -> (String, String, Option<NaiveDate>) {
        (self.value.canonical(), self.unit.clone(), self.observed_at)
    }
}

/// A Type node plus the values observed under it in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationGroup {
    pub type_attrs: ObservationTypeAttrs,
    pub values: Vec<ObservationValueDraft>,
}

/// Everything persisted for one document, committed atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentBatch {
    pub document: DocumentReference,
    pub groups: Vec<ObservationGroup>,
}

/// Result of committing one document batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub types_created: usize,
    pub values_created: usize,
    /// Values that already existed (idempotent reprocessing).
    pub values_merged: usize,
}

/// Flattened read result: one observation with its Type attributes, always
/// produced by a patient-anchored traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub type_name: String,
    pub catalog_id: Option<String>,
    pub validated: bool,
    pub value: ObservedValue,
    pub unit: String,
    pub observed_at: Option<NaiveDate>,
    pub status: Option<RangeStatus>,
    pub source_document: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvalidated_key_uses_surrogate_id() {
        let key = ObservationTypeKey::unvalidated("xyz-novel-marker", "mg/dL");
        assert_eq!(key.catalog_id, "raw:xyz-novel-marker");
        assert!(!key.is_validated());
        assert_eq!(key.catalog_id(), None);
    }

    #[test]
    fn resolved_key_exposes_catalog_id() {
        let key = ObservationTypeKey::resolved("cat-hdl", "mg/dL");
        assert!(key.is_validated());
        assert_eq!(key.catalog_id(), Some("cat-hdl"));
    }

    #[test]
    fn same_catalog_id_and_unit_are_one_key() {
        let a = ObservationTypeKey::resolved("cat-hdl", "mg/dL");
        let b = ObservationTypeKey::resolved("cat-hdl", "mg/dL");
        assert_eq!(a, b);
        let c = ObservationTypeKey::resolved("cat-hdl", "mmol/L");
        assert_ne!(a, c);
    }

    #[test]
    fn dedup_key_collapses_equal_observations() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1);
        let a = ObservationValueDraft {
            value: ObservedValue::Numeric(55.0),
            unit: "mg/dL".into(),
            observed_at: date,
            status: None,
        };
        let b = ObservationValueDraft {
            value: ObservedValue::Numeric(55.0),
            unit: "mg/dL".into(),
            observed_at: date,
            status: Some(RangeStatus::Normal),
        };
        // Status is derived, not identity.
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
