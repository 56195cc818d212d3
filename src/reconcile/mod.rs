//! Catalog reconciliation: map extracted biomarker names onto canonical
//! catalog entries, normalize units, label values against reference ranges,
//! and group everything for an atomic graph commit.
//!
//! Unmatched markers are never dropped. They are grouped under a surrogate
//! type key and persisted unvalidated, so a novel marker still shows up in
//! the patient's history.

pub mod catalog;
pub mod engine;
pub mod units;

pub use catalog::{best_match, name_similarity, CatalogClient, HttpCatalogClient, StaticCatalog};
pub use engine::{ReconciledGroup, ReconciledSet, ReconciliationEngine};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(String),

    #[error("catalog returned malformed data: {0}")]
    Malformed(String),

    #[error("catalog lookup exceeded {seconds}s timeout")]
    Timeout { seconds: u64 },
}
