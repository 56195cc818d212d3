//! Extraction engine: render, call the vision model once across all pages,
//! parse and sanitize.
//!
//! The model call is bounded by the configured timeout and raced against the
//! task's cancellation signal, so a hung endpoint can never pin a permit.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

use super::format::DocumentBlob;
use super::renderer::{render_document, PageImage};
use super::vision::{parse_extraction, VisionModel, EXTRACTION_INSTRUCTION};
use super::{normalize, ExtractionError};
use crate::config::PipelineConfig;
use crate::model::PipelineResult;

pub struct ExtractionEngine {
    vision: Arc<dyn VisionModel>,
    render_permits: Arc<Semaphore>,
    config: PipelineConfig,
}

impl ExtractionEngine {
    pub fn new(
        vision: Arc<dyn VisionModel>,
        render_permits: Arc<Semaphore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            vision,
            render_permits,
            config,
        }
    }

    /// Validate the upload and render it to page images.
    pub async fn prepare_pages(
        &self,
        blob: &DocumentBlob,
    ) -> Result<Vec<PageImage>, ExtractionError> {
        let pages = render_document(blob, Arc::clone(&self.render_permits)).await?;
        tracing::debug!(document = %blob.name, pages = pages.len(), "document rendered");
        Ok(pages)
    }

    /// One cross-page model call, retried once on failure, then parsed and
    /// sanitized.
    pub async fn extract_biomarkers(
        &self,
        pages: &[PageImage],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PipelineResult, ExtractionError> {
        let mut last_err = None;
        for attempt in 0..2 {
            match self.call_model(pages, cancel).await {
                Ok(raw) => match parse_extraction(&raw) {
                    Ok(mut result) => {
                        normalize::sanitize_result(&mut result);
                        tracing::info!(
                            biomarkers = result.biomarkers.len(),
                            attempt,
                            "extraction complete"
                        );
                        return Ok(result);
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "model output failed to parse");
                        last_err = Some(e);
                    }
                },
                Err(ExtractionError::Cancelled) => return Err(ExtractionError::Cancelled),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "extraction call failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ExtractionError::Model("no attempt made".into())))
    }

    async fn call_model(
        &self,
        pages: &[PageImage],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, ExtractionError> {
        if *cancel.borrow() {
            return Err(ExtractionError::Cancelled);
        }
        let seconds = self.config.call_timeout_secs;
        tokio::select! {
            _ = cancel.changed() => Err(ExtractionError::Cancelled),
            outcome = timeout(self.config.call_timeout(), self.vision.extract(pages, EXTRACTION_INSTRUCTION)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ExtractionError::Timeout { seconds }),
                }
            }
        }
    }

    /// Full extraction: validate, render, extract.
    pub async fn extract(
        &self,
        blob: &DocumentBlob,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PipelineResult, ExtractionError> {
        let pages = self.prepare_pages(blob).await?;
        self.extract_biomarkers(&pages, cancel).await
    }
}
