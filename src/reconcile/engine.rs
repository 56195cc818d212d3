//! Reconciliation engine.
//!
//! Catalog lookups for one document fan out concurrently, then a serial
//! merge pass groups values under `(catalog_id, unit)` type keys, dedupes
//! repeats, and labels numeric values against reference ranges. A catalog
//! failure downgrades the marker to unvalidated instead of failing the
//! document.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::time::timeout;

use super::catalog::{best_match, CatalogClient};
use super::units::canonical_unit;
use crate::config::PipelineConfig;
use crate::extraction::normalize::normalize_key;
use crate::model::{
    Biomarker, CatalogEntry, MarkerKind, ObservationTypeAttrs, ObservationTypeKey,
    ObservationValueDraft, PipelineResult,
};

/// A resolved type plus its deduplicated values for one document.
#[derive(Debug, Clone)]
pub struct ReconciledGroup {
    pub type_attrs: ObservationTypeAttrs,
    pub values: Vec<ObservationValueDraft>,
}

/// Everything reconciliation produced for one document.
#[derive(Debug, Clone)]
pub struct ReconciledSet {
    pub groups: Vec<ReconciledGroup>,
    /// Observed values seen before deduplication.
    pub input_count: usize,
    /// Markers that ended up without a catalog match.
    pub unvalidated_count: usize,
}

pub struct ReconciliationEngine {
    catalog: Arc<dyn CatalogClient>,
    config: PipelineConfig,
}

impl ReconciliationEngine {
    pub fn new(catalog: Arc<dyn CatalogClient>, config: PipelineConfig) -> Self {
        Self { catalog, config }
    }

    /// Reconcile one extraction result. Infallible by design: the worst
    /// outcome for any marker is an unvalidated group.
    pub async fn reconcile(&self, result: &PipelineResult) -> ReconciledSet {
        let matches = self.lookup_all(&result.biomarkers).await;

        let fallback_date = result.metadata.default_observation_date();
        let mut groups: HashMap<ObservationTypeKey, ReconciledGroup> = HashMap::new();
        let mut input_count = 0;
        let mut unvalidated_markers = 0;

        for (marker, matched) in result.biomarkers.iter().zip(matches) {
            if matched.is_none() {
                unvalidated_markers += 1;
            }
            for value in &marker.values {
                input_count += 1;
                let raw_unit = value.unit.as_deref().map(str::trim).unwrap_or("");
                let unit = canonical_unit(raw_unit);
                // A malformed unit keeps its original spelling in the key,
                // so it never collapses into the unitless group; it only
                // loses range labeling.
                let unit_key = unit.clone().unwrap_or_else(|| raw_unit.to_string());
                let observed_at = value.observed_at.or(fallback_date);

                let (key, attrs) = match &matched {
                    Some(entry) => (
                        ObservationTypeKey::resolved(&entry.id, &unit_key),
                        type_attrs_for_match(entry, &unit_key),
                    ),
                    None => {
                        let key = ObservationTypeKey::unvalidated(
                            &normalize_key(&marker.observed_name),
                            &unit_key,
                        );
                        (key.clone(), type_attrs_for_raw(marker, key))
                    }
                };

                let status = match (&matched, value.value.as_numeric()) {
                    (Some(entry), Some(n)) if marker.kind == MarkerKind::Lab => {
                        unit.as_deref()
                            .and_then(|u| entry.interval_for(u))
                            .map(|interval| interval.status_of(n))
                    }
                    _ => None,
                };

                let draft = ObservationValueDraft {
                    value: value.value.clone(),
                    unit: unit_key,
                    observed_at,
                    status,
                };

                let group = groups.entry(key).or_insert_with(|| ReconciledGroup {
                    type_attrs: attrs,
                    values: Vec::new(),
                });
                if !group
                    .values
                    .iter()
                    .any(|existing| existing.dedup_key() == draft.dedup_key())
                {
                    group.values.push(draft);
                }
            }
        }

        let mut groups: Vec<ReconciledGroup> = groups.into_values().collect();
        groups.sort_by(|a, b| {
            (&a.type_attrs.key.catalog_id, &a.type_attrs.key.unit)
                .cmp(&(&b.type_attrs.key.catalog_id, &b.type_attrs.key.unit))
        });

        let deduped: usize = groups.iter().map(|g| g.values.len()).sum();
        tracing::info!(
            markers = result.biomarkers.len(),
            values_in = input_count,
            values_out = deduped,
            unvalidated = unvalidated_markers,
            "reconciliation complete"
        );

        ReconciledSet {
            groups,
            input_count,
            unvalidated_count: unvalidated_markers,
        }
    }

    /// Concurrent catalog lookups, one per marker, each individually bounded
    /// by the call timeout. Errors and timeouts yield `None`.
    async fn lookup_all(&self, markers: &[Biomarker]) -> Vec<Option<CatalogEntry>> {
        let lookups = markers.iter().map(|marker| async move {
            let outcome = timeout(
                self.config.call_timeout(),
                self.catalog.search(&marker.observed_name),
            )
            .await;
            let candidates = match outcome {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(e)) => {
                    tracing::warn!(marker = %marker.observed_name, error = %e,
                        "catalog lookup failed, keeping marker unvalidated");
                    return None;
                }
                Err(_) => {
                    tracing::warn!(marker = %marker.observed_name,
                        "catalog lookup timed out, keeping marker unvalidated");
                    return None;
                }
            };
            best_match(
                &marker.known_names(),
                &candidates,
                self.config.catalog_similarity_threshold,
            )
            .map(|(entry, score)| {
                tracing::debug!(marker = %marker.observed_name, catalog_id = %entry.id,
                    score, "catalog match");
                entry.clone()
            })
        });
        join_all(lookups).await
    }
}

fn type_attrs_for_match(entry: &CatalogEntry, unit_key: &str) -> ObservationTypeAttrs {
    ObservationTypeAttrs {
        key: ObservationTypeKey::resolved(&entry.id, unit_key),
        canonical_name: entry.long_name.clone(),
        display_name: entry
            .short_name
            .clone()
            .unwrap_or_else(|| entry.long_name.clone()),
        aliases: entry.aliases.clone(),
        validated: true,
    }
}

fn type_attrs_for_raw(marker: &Biomarker, key: ObservationTypeKey) -> ObservationTypeAttrs {
    ObservationTypeAttrs {
        key,
        canonical_name: marker.observed_name.clone(),
        display_name: marker.observed_name.clone(),
        aliases: marker.aliases.clone(),
        validated: false,
    }
}
