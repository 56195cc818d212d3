//! In-memory graph store.
//!
//! Used in tests and single-node deployments that don't run a graph
//! database. One write lock per commit gives the same atomicity a driver
//! transaction does.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{GraphStore, ObservationFilter};
use super::GraphError;
use crate::model::{
    CommitSummary, DocumentBatch, DocumentReference, ObservationRecord, ObservationTypeAttrs,
    ObservationTypeKey, ObservedValue, PatientScope, RangeStatus,
};

#[derive(Debug, Clone)]
struct StoredValue {
    patient_id: String,
    user_id: String,
    type_key: ObservationTypeKey,
    value: ObservedValue,
    unit: String,
    observed_at: Option<NaiveDate>,
    status: Option<RangeStatus>,
    source_document: Uuid,
}

#[derive(Default)]
struct State {
    documents: HashMap<Uuid, DocumentReference>,
    types: HashMap<ObservationTypeKey, ObservationTypeAttrs>,
    /// Keyed by `(patient, type key, value, unit, date)` dedup identity.
    values: HashMap<String, StoredValue>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    state: RwLock<State>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct Type nodes, across all tenants. Test-facing.
    pub fn type_count(&self) -> usize {
        self.state.read().types.len()
    }

    /// Number of stored value nodes, across all tenants. Test-facing.
    pub fn value_count(&self) -> usize {
        self.state.read().values.len()
    }

    /// Distinct user ids on stored value nodes, across all tenants, sorted.
    /// Test-facing.
    pub fn value_user_ids(&self) -> Vec<String> {
        let state = self.state.read();
        let mut ids: Vec<String> = state.values.values().map(|v| v.user_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn value_identity(patient_id: &str, key: &ObservationTypeKey, draft_key: &(String, String, Option<NaiveDate>)) -> String {
    format!(
        "{patient_id}|{}|{}|{}|{}|{}",
        key.catalog_id,
        key.unit,
        draft_key.0,
        draft_key.1,
        draft_key.2.map(|d| d.to_string()).unwrap_or_default()
    )
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn commit_document(&self, batch: &DocumentBatch) -> Result<CommitSummary, GraphError> {
        let mut state = self.state.write();
        let mut summary = CommitSummary::default();

        state
            .documents
            .entry(batch.document.uuid)
            .or_insert_with(|| batch.document.clone());

        for group in &batch.groups {
            let key = group.type_attrs.key.clone();
            if !state.types.contains_key(&key) {
                state.types.insert(key.clone(), group.type_attrs.clone());
                summary.types_created += 1;
            }
            for draft in &group.values {
                let identity =
                    value_identity(&batch.document.patient_id, &key, &draft.dedup_key());
                if let Some(existing) = state.values.get_mut(&identity) {
                    // Derived status may change when the catalog does.
                    existing.status = draft.status;
                    summary.values_merged += 1;
                } else {
                    state.values.insert(
                        identity,
                        StoredValue {
                            patient_id: batch.document.patient_id.clone(),
                            user_id: batch.document.user_id.clone(),
                            type_key: key.clone(),
                            value: draft.value.clone(),
                            unit: draft.unit.clone(),
                            observed_at: draft.observed_at,
                            status: draft.status,
                            source_document: batch.document.uuid,
                        },
                    );
                    summary.values_created += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn observations(
        &self,
        scope: &PatientScope,
        filter: &ObservationFilter,
    ) -> Result<Vec<ObservationRecord>, GraphError> {
        let state = self.state.read();
        let mut records: Vec<ObservationRecord> = state
            .values
            .values()
            .filter(|v| v.patient_id == scope.patient_id)
            .filter(|v| {
                state
                    .documents
                    .get(&v.source_document)
                    .map(|d| !d.deleted)
                    .unwrap_or(false)
            })
            .filter_map(|v| {
                let attrs = state.types.get(&v.type_key)?;
                Some(ObservationRecord {
                    type_name: attrs.canonical_name.clone(),
                    catalog_id: v.type_key.catalog_id().map(str::to_string),
                    validated: attrs.validated,
                    value: v.value.clone(),
                    unit: v.unit.clone(),
                    observed_at: v.observed_at,
                    status: v.status,
                    source_document: v.source_document,
                })
            })
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by(|a, b| {
            (a.observed_at, &a.type_name).cmp(&(b.observed_at, &b.type_name))
        });
        Ok(records)
    }

    async fn documents(&self, scope: &PatientScope) -> Result<Vec<DocumentReference>, GraphError> {
        let state = self.state.read();
        let mut docs: Vec<DocumentReference> = state
            .documents
            .values()
            .filter(|d| d.patient_id == scope.patient_id && !d.deleted)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn soft_delete_document(
        &self,
        scope: &PatientScope,
        document_uuid: Uuid,
    ) -> Result<bool, GraphError> {
        let mut state = self.state.write();
        match state.documents.get_mut(&document_uuid) {
            Some(doc) if doc.patient_id == scope.patient_id => {
                doc.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
