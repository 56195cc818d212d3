//! Tenant-scoped graph storage.
//!
//! The graph holds two kinds of nodes. Instance nodes (`DocumentReferenceNode`,
//! `ObservationValueNode`) carry a `patient_id` and belong to one patient.
//! Type nodes (`ObservationTypeNode`) are shared ontology and carry none.
//! Every read starts from an Instance node and traverses `INSTANCE_OF`
//! edges outward, so patient isolation is structural rather than filtered
//! in afterwards.

pub mod cypher;
pub mod driver;
pub mod memory;
pub mod store;

pub use driver::{CypherQuery, GraphDriver, HttpGraphDriver};
pub use memory::MemoryGraphStore;
pub use store::{CypherGraphStore, GraphStore, ObservationFilter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph driver error: {0}")]
    Driver(String),

    #[error("graph call exceeded {seconds}s timeout")]
    Timeout { seconds: u64 },

    #[error("graph constraint violated: {0}")]
    Constraint(String),

    #[error("graph returned malformed row: {0}")]
    MalformedRow(String),
}
