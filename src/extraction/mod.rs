//! Document extraction: format validation, PDF page rendering, vision-model
//! extraction, and text sanitization.
//!
//! The engine takes raw uploaded bytes and produces a [`PipelineResult`]
//! (biomarkers plus document metadata). Everything downstream of the vision
//! call is deterministic.
//!
//! [`PipelineResult`]: crate::model::PipelineResult

pub mod engine;
pub mod format;
pub mod normalize;
pub mod renderer;
pub mod vision;

pub use engine::ExtractionEngine;
pub use format::{DocumentBlob, DocumentFormat};
pub use renderer::PageImage;
pub use vision::{HttpVisionModel, VisionModel};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported document format: {declared}")]
    UnsupportedFormat { declared: String },

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("image processing failed: {0}")]
    ImageProcessing(String),

    #[error("vision model call failed: {0}")]
    Model(String),

    #[error("vision model returned malformed output: {0}")]
    MalformedResponse(String),

    #[error("extraction call exceeded {seconds}s timeout")]
    Timeout { seconds: u64 },

    #[error("extraction was cancelled")]
    Cancelled,
}
