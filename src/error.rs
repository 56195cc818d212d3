//! Top-level pipeline error.
//!
//! Stage modules define their own error enums; this type exists so the
//! scheduler and the public facade can report any stage failure uniformly.

use thiserror::Error;

use crate::extraction::ExtractionError;
use crate::graph::GraphError;
use crate::query::QueryError;
use crate::reconcile::CatalogError;
use crate::scheduler::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("task was cancelled")]
    Cancelled,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    /// Whether this failure came from the user cancelling the task, as
    /// opposed to the pipeline itself going wrong.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Extraction(ExtractionError::Cancelled)
        )
    }
}
