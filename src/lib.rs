//! Medical document ingestion and tenant-scoped graph storage.
//!
//! Uploaded lab reports are rendered to page images, read by a vision
//! model, reconciled against a shared biomarker catalog, and committed to a
//! patient-scoped graph. A query layer answers natural-language questions
//! over that graph, template-first with validated model-generated Cypher as
//! fallback.

pub mod config;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod scheduler;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineDeps};

use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG`, defaulting to this crate at debug.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}
