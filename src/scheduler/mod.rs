//! Processing scheduler: admission, concurrency caps, per-task lifecycle.
//!
//! Documents are admitted first-in first-out, bounded by a global cap and a
//! per-user cap, and each task walks the fixed stage sequence render,
//! extract, reconcile, persist. Cancellation is checked at every stage
//! boundary and raced against the in-flight model call.

pub mod events;
pub mod queue;

pub use events::{ChannelSink, NullSink, ProgressEvent, ProgressSink, TaskStage, TaskStatus};
pub use queue::{DocumentSubmission, ProcessingScheduler, SubmittedTask};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored document not found: {0}")]
    NotFound(String),

    #[error("storage I/O failed: {0}")]
    Io(String),
}

/// Seam for the blob store holding uploaded documents.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Fetch the raw bytes of one stored upload.
    async fn fetch(&self, storage_key: &str) -> Result<Vec<u8>, StorageError>;
}
