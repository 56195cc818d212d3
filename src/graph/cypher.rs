//! Cypher statement builders.
//!
//! All statements are parameterized; no user-controlled text is ever
//! interpolated into query text. Reads are anchored on an Instance node
//! carrying `$patient_id` and traverse outward, never the other way.

use serde_json::Value;

use super::driver::CypherQuery;
use crate::model::{
    DocumentReference, ObservationTypeAttrs, ObservationValueDraft, ObservedValue, PatientScope,
};

pub const DOCUMENT_LABEL: &str = "DocumentReferenceNode";
pub const VALUE_LABEL: &str = "ObservationValueNode";
pub const TYPE_LABEL: &str = "ObservationTypeNode";
pub const INSTANCE_OF: &str = "INSTANCE_OF";
pub const DERIVED_FROM: &str = "DERIVED_FROM";

fn date_param(date: Option<chrono::NaiveDate>) -> Value {
    match date {
        Some(d) => Value::String(d.to_string()),
        None => Value::Null,
    }
}

/// Upsert the document node. Idempotent on `uuid`.
pub fn merge_document(doc: &DocumentReference) -> CypherQuery {
    CypherQuery::new(format!(
        "MERGE (d:{DOCUMENT_LABEL} {{uuid: $uuid}}) \
         SET d.patient_id = $patient_id, d.user_id = $user_id, \
             d.document_name = $document_name, d.source_hash = $source_hash, \
             d.report_date = $report_date, d.created_at = $created_at, \
             d.deleted = coalesce(d.deleted, false)"
    ))
    .param("uuid", doc.uuid.to_string())
    .param("patient_id", doc.patient_id.clone())
    .param("user_id", doc.user_id.clone())
    .param("document_name", doc.document_name.clone())
    .param("source_hash", doc.source_hash.clone())
    .param("report_date", date_param(doc.report_date))
    .param("created_at", doc.created_at.to_rfc3339())
}

/// Get-or-create the Type node for `(catalog_id, unit)`. Returns `created`
/// as 1 or 0 so the caller can tally new types.
pub fn merge_type(attrs: &ObservationTypeAttrs, tx_tag: &str) -> CypherQuery {
    CypherQuery::new(format!(
        "MERGE (t:{TYPE_LABEL} {{catalog_id: $catalog_id, unit: $unit}}) \
         ON CREATE SET t.canonical_name = $canonical_name, \
                       t.display_name = $display_name, t.aliases = $aliases, \
                       t.validated = $validated, t._tx = $tx_tag \
         WITH t, CASE WHEN t._tx = $tx_tag THEN 1 ELSE 0 END AS created \
         REMOVE t._tx \
         RETURN created"
    ))
    .param("catalog_id", attrs.key.catalog_id.clone())
    .param("unit", attrs.key.unit.clone())
    .param("canonical_name", attrs.canonical_name.clone())
    .param("display_name", attrs.display_name.clone())
    .param(
        "aliases",
        Value::Array(attrs.aliases.iter().cloned().map(Value::String).collect()),
    )
    .param("validated", attrs.validated)
    .param("tx_tag", tx_tag.to_string())
}

/// Upsert one observation value under its Type node and source document.
///
/// Identity is the dedup key `(patient, type, value, unit, date)`; merging
/// an existing key is a no-op apart from refreshing the derived status.
/// Returns `created` as 1 or 0.
pub fn merge_value(
    scope_patient: &str,
    scope_user: &str,
    attrs: &ObservationTypeAttrs,
    draft: &ObservationValueDraft,
    document_uuid: &str,
    value_uuid: &str,
) -> CypherQuery {
    let (value_numeric, value_text) = match &draft.value {
        ObservedValue::Numeric(n) => (Value::from(*n), Value::Null),
        ObservedValue::Text(t) => (Value::Null, Value::String(t.clone())),
    };
    let dedup = format!(
        "{}|{}|{}|{}|{}",
        scope_patient,
        attrs.key.catalog_id,
        attrs.key.unit,
        draft.value.canonical(),
        draft
            .observed_at
            .map(|d| d.to_string())
            .unwrap_or_default()
    );
    CypherQuery::new(format!(
        "MATCH (t:{TYPE_LABEL} {{catalog_id: $catalog_id, unit: $unit}}) \
         MATCH (d:{DOCUMENT_LABEL} {{uuid: $document_uuid}}) \
         MERGE (v:{VALUE_LABEL} {{dedup_key: $dedup_key}}) \
         ON CREATE SET v.uuid = $value_uuid, v.patient_id = $patient_id, \
                       v.user_id = $user_id, v.value_numeric = $value_numeric, \
                       v.value_text = $value_text, v.unit = $value_unit, \
                       v.observed_at = $observed_at \
         SET v.status = $status \
         MERGE (v)-[:{INSTANCE_OF}]->(t) \
         MERGE (v)-[:{DERIVED_FROM}]->(d) \
         RETURN CASE WHEN v.uuid = $value_uuid THEN 1 ELSE 0 END AS created"
    ))
    .param("catalog_id", attrs.key.catalog_id.clone())
    .param("unit", attrs.key.unit.clone())
    .param("document_uuid", document_uuid.to_string())
    .param("dedup_key", dedup)
    .param("value_uuid", value_uuid.to_string())
    .param("patient_id", scope_patient.to_string())
    .param("user_id", scope_user.to_string())
    .param("value_numeric", value_numeric)
    .param("value_text", value_text)
    .param("value_unit", draft.unit.clone())
    .param("observed_at", date_param(draft.observed_at))
    .param(
        "status",
        match draft.status {
            Some(s) => Value::String(s.as_str().to_string()),
            None => Value::Null,
        },
    )
}

/// Patient-anchored observation read. Starts at the patient's value nodes
/// and walks `INSTANCE_OF` out to the shared Type node.
pub fn select_observations(scope: &PatientScope) -> CypherQuery {
    CypherQuery::new(format!(
        "MATCH (v:{VALUE_LABEL} {{patient_id: $patient_id}})-[:{DERIVED_FROM}]->(d:{DOCUMENT_LABEL}) \
         MATCH (v)-[:{INSTANCE_OF}]->(t:{TYPE_LABEL}) \
         WHERE NOT coalesce(d.deleted, false) \
         RETURN t.canonical_name AS type_name, t.catalog_id AS catalog_id, \
                t.validated AS validated, v.value_numeric AS value_numeric, \
                v.value_text AS value_text, v.unit AS unit, \
                v.observed_at AS observed_at, v.status AS status, \
                d.uuid AS source_document \
         ORDER BY v.observed_at, t.canonical_name"
    ))
    .param("patient_id", scope.patient_id.clone())
}

/// Patient-anchored document listing, excluding soft-deleted documents.
pub fn select_documents(scope: &PatientScope) -> CypherQuery {
    CypherQuery::new(format!(
        "MATCH (d:{DOCUMENT_LABEL} {{patient_id: $patient_id}}) \
         WHERE NOT coalesce(d.deleted, false) \
         RETURN d.uuid AS uuid, d.patient_id AS patient_id, d.user_id AS user_id, \
                d.document_name AS document_name, d.source_hash AS source_hash, \
                d.report_date AS report_date, d.created_at AS created_at, \
                d.deleted AS deleted \
         ORDER BY d.created_at"
    ))
    .param("patient_id", scope.patient_id.clone())
}

/// Soft delete: the document and its observations stop appearing in reads
/// but stay in the graph. Returns the number of documents flagged.
pub fn soft_delete_document(scope: &PatientScope, document_uuid: &str) -> CypherQuery {
    CypherQuery::new(format!(
        "MATCH (d:{DOCUMENT_LABEL} {{uuid: $uuid, patient_id: $patient_id}}) \
         SET d.deleted = true \
         RETURN count(d) AS flagged"
    ))
    .param("uuid", document_uuid.to_string())
    .param("patient_id", scope.patient_id.clone())
}
