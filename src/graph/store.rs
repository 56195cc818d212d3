//! The store trait and its Cypher-backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::cypher;
use super::driver::GraphDriver;
use super::GraphError;
use crate::model::{
    CommitSummary, DocumentBatch, DocumentReference, ObservationRecord, ObservedValue,
    PatientScope, RangeStatus,
};

/// Read filter for observation queries. Everything optional; the patient
/// anchor comes from [`PatientScope`], not from here.
#[derive(Debug, Clone, Default)]
pub struct ObservationFilter {
    /// Case-insensitive substring on the type's canonical name.
    pub name_contains: Option<String>,
    /// Only values labeled outside their reference range.
    pub abnormal_only: bool,
    /// Only values observed on or after this date.
    pub since: Option<NaiveDate>,
}

impl ObservationFilter {
    pub fn matches(&self, record: &ObservationRecord) -> bool {
        if let Some(needle) = &self.name_contains {
            if !record
                .type_name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if self.abnormal_only
            && !matches!(record.status, Some(RangeStatus::Low) | Some(RangeStatus::High))
        {
            return false;
        }
        if let Some(since) = self.since {
            match record.observed_at {
                Some(date) if date >= since => {}
                _ => return false,
            }
        }
        true
    }
}

/// Persistence seam for the reconciled graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Commit one document batch atomically. Re-committing the same batch
    /// merges instead of duplicating.
    async fn commit_document(&self, batch: &DocumentBatch) -> Result<CommitSummary, GraphError>;

    /// Patient-anchored observation read.
    async fn observations(
        &self,
        scope: &PatientScope,
        filter: &ObservationFilter,
    ) -> Result<Vec<ObservationRecord>, GraphError>;

    /// Patient-anchored document listing (soft-deleted excluded).
    async fn documents(&self, scope: &PatientScope) -> Result<Vec<DocumentReference>, GraphError>;

    /// Soft-delete one document. Returns false when no document with that
    /// uuid belongs to the patient.
    async fn soft_delete_document(
        &self,
        scope: &PatientScope,
        document_uuid: Uuid,
    ) -> Result<bool, GraphError>;
}

/// Store backed by a Cypher [`GraphDriver`].
pub struct CypherGraphStore<D> {
    driver: D,
}

impl<D: GraphDriver> CypherGraphStore<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }
}

fn created_count(rows: &[Value]) -> usize {
    rows.iter()
        .filter(|row| row.get("created").and_then(Value::as_i64) == Some(1))
        .count()
}

fn get_str(row: &Value, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_date(row: &Value, key: &str) -> Option<NaiveDate> {
    row.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn observation_from_row(row: &Value) -> Result<ObservationRecord, GraphError> {
    let value = match row.get("value_numeric").and_then(Value::as_f64) {
        Some(n) => ObservedValue::Numeric(n),
        None => ObservedValue::Text(get_str(row, "value_text").ok_or_else(|| {
            GraphError::MalformedRow("observation has neither numeric nor text value".into())
        })?),
    };
    let source_document = get_str(row, "source_document")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GraphError::MalformedRow("missing source_document uuid".into()))?;
    Ok(ObservationRecord {
        type_name: get_str(row, "type_name")
            .ok_or_else(|| GraphError::MalformedRow("missing type_name".into()))?,
        catalog_id: get_str(row, "catalog_id").filter(|id| !id.starts_with("raw:")),
        validated: row.get("validated").and_then(Value::as_bool).unwrap_or(false),
        value,
        unit: get_str(row, "unit").unwrap_or_default(),
        observed_at: get_date(row, "observed_at"),
        status: row
            .get("status")
            .cloned()
            .and_then(|v| serde_json::from_value::<RangeStatus>(v).ok()),
        source_document,
    })
}

fn document_from_row(row: &Value) -> Result<DocumentReference, GraphError> {
    let uuid = get_str(row, "uuid")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GraphError::MalformedRow("missing document uuid".into()))?;
    let created_at = get_str(row, "created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| GraphError::MalformedRow("missing created_at".into()))?;
    Ok(DocumentReference {
        uuid,
        patient_id: get_str(row, "patient_id").unwrap_or_default(),
        user_id: get_str(row, "user_id").unwrap_or_default(),
        document_name: get_str(row, "document_name").unwrap_or_default(),
        source_hash: get_str(row, "source_hash").unwrap_or_default(),
        report_date: get_date(row, "report_date"),
        created_at,
        deleted: row.get("deleted").and_then(Value::as_bool).unwrap_or(false),
    })
}

#[async_trait]
impl<D: GraphDriver> GraphStore for CypherGraphStore<D> {
    async fn commit_document(&self, batch: &DocumentBatch) -> Result<CommitSummary, GraphError> {
        let tx_tag = Uuid::new_v4().to_string();
        let mut statements = vec![cypher::merge_document(&batch.document)];
        let document_uuid = batch.document.uuid.to_string();
        let mut type_statements = 0;

        for group in &batch.groups {
            statements.push(cypher::merge_type(&group.type_attrs, &tx_tag));
            type_statements += 1;
            for draft in &group.values {
                statements.push(cypher::merge_value(
                    &batch.document.patient_id,
                    &batch.document.user_id,
                    &group.type_attrs,
                    draft,
                    &document_uuid,
                    &Uuid::new_v4().to_string(),
                ));
            }
        }

        let results = self.driver.execute(&statements).await?;

        // Statement 0 is the document; then, per group, one type statement
        // followed by its value statements.
        let mut types_created = 0;
        let mut values_created = 0;
        let mut values_merged = 0;
        let mut idx = 1;
        for group in &batch.groups {
            if let Some(rows) = results.get(idx) {
                types_created += created_count(rows);
            }
            idx += 1;
            for _ in &group.values {
                if let Some(rows) = results.get(idx) {
                    let created = created_count(rows);
                    values_created += created;
                    values_merged += rows.len().saturating_sub(created);
                }
                idx += 1;
            }
        }

        let summary = CommitSummary {
            types_created,
            values_created,
            values_merged,
        };
        tracing::info!(
            document = %batch.document.uuid,
            groups = type_statements,
            types_created = summary.types_created,
            values_created = summary.values_created,
            values_merged = summary.values_merged,
            "document batch committed"
        );
        Ok(summary)
    }

    async fn observations(
        &self,
        scope: &PatientScope,
        filter: &ObservationFilter,
    ) -> Result<Vec<ObservationRecord>, GraphError> {
        let results = self
            .driver
            .execute(&[cypher::select_observations(scope)])
            .await?;
        let rows = results.into_iter().next().unwrap_or_default();
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = observation_from_row(row)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn documents(&self, scope: &PatientScope) -> Result<Vec<DocumentReference>, GraphError> {
        let results = self
            .driver
            .execute(&[cypher::select_documents(scope)])
            .await?;
        let rows = results.into_iter().next().unwrap_or_default();
        rows.iter().map(document_from_row).collect()
    }

    async fn soft_delete_document(
        &self,
        scope: &PatientScope,
        document_uuid: Uuid,
    ) -> Result<bool, GraphError> {
        let results = self
            .driver
            .execute(&[cypher::soft_delete_document(
                scope,
                &document_uuid.to_string(),
            )])
            .await?;
        let flagged = results
            .first()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("flagged"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(flagged > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: Option<RangeStatus>, date: Option<NaiveDate>) -> ObservationRecord {
        ObservationRecord {
            type_name: name.into(),
            catalog_id: Some("cat-x".into()),
            validated: true,
            value: ObservedValue::Numeric(1.0),
            unit: "mg/dL".into(),
            observed_at: date,
            status,
            source_document: Uuid::new_v4(),
        }
    }

    #[test]
    fn filter_name_is_case_insensitive_substring() {
        let filter = ObservationFilter {
            name_contains: Some("hdl".into()),
            ..Default::default()
        };
        assert!(filter.matches(&record("HDL Cholesterol", None, None)));
        assert!(!filter.matches(&record("Ferritin", None, None)));
    }

    #[test]
    fn abnormal_filter_keeps_low_and_high_only() {
        let filter = ObservationFilter {
            abnormal_only: true,
            ..Default::default()
        };
        assert!(filter.matches(&record("A", Some(RangeStatus::High), None)));
        assert!(filter.matches(&record("B", Some(RangeStatus::Low), None)));
        assert!(!filter.matches(&record("C", Some(RangeStatus::Normal), None)));
        assert!(!filter.matches(&record("D", None, None)), "unlabeled is not abnormal");
    }

    #[test]
    fn since_filter_drops_dateless_records() {
        let filter = ObservationFilter {
            since: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        };
        assert!(filter.matches(&record("A", None, NaiveDate::from_ymd_opt(2026, 1, 1))));
        assert!(!filter.matches(&record("B", None, NaiveDate::from_ymd_opt(2025, 12, 31))));
        assert!(!filter.matches(&record("C", None, None)));
    }

    #[test]
    fn observation_row_parses_text_and_status() {
        let row = serde_json::json!({
            "type_name": "HSV-1 IgG",
            "catalog_id": "raw:hsv1igg",
            "validated": false,
            "value_numeric": null,
            "value_text": "Negative",
            "unit": "",
            "observed_at": "2026-03-01",
            "status": null,
            "source_document": Uuid::new_v4().to_string(),
        });
        let record = observation_from_row(&row).unwrap();
        assert_eq!(record.value, ObservedValue::Text("Negative".into()));
        assert_eq!(record.catalog_id, None, "surrogate ids are not catalog ids");
        assert_eq!(record.status, None);
    }

    #[test]
    fn observation_row_without_any_value_is_malformed() {
        let row = serde_json::json!({
            "type_name": "X",
            "source_document": Uuid::new_v4().to_string(),
        });
        assert!(matches!(
            observation_from_row(&row),
            Err(GraphError::MalformedRow(_))
        ));
    }
}
