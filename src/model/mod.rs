//! Core data model: pipeline-internal biomarker types, the read-only catalog
//! shape, and the graph node records.

pub mod biomarker;
pub mod catalog;
pub mod graph;

pub use biomarker::{
    Biomarker, BiomarkerValue, BoundingBox, DocumentMetadata, FieldLocations, MarkerKind,
    ObservedValue, PipelineResult, SourceLocation,
};
pub use catalog::{CatalogEntry, RangeStatus, ReferenceInterval};
pub use graph::{
    CommitSummary, DocumentBatch, DocumentReference, ObservationGroup, ObservationRecord,
    ObservationTypeAttrs, ObservationTypeKey, ObservationValueDraft, PatientScope,
};
