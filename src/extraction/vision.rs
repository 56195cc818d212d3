//! Vision-model client for biomarker extraction.
//!
//! All pages of a document go out in one multimodal call so the model can
//! resolve cross-page context (a panel header on page 1, its rows on page 2).
//! The response contract is strict JSON; fenced code blocks are tolerated
//! and stripped before parsing.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::NaiveDate;
use serde::Deserialize;

use super::renderer::PageImage;
use super::ExtractionError;
use crate::model::{
    Biomarker, BiomarkerValue, BoundingBox, DocumentMetadata, FieldLocations, MarkerKind,
    ObservedValue, PipelineResult, SourceLocation,
};

// ──────────────────────────────────────────────
// Prompt
// ──────────────────────────────────────────────

/// Extraction instruction sent alongside the page images.
pub const EXTRACTION_INSTRUCTION: &str = "\
You are a medical lab report extractor. Extract every biomarker observation \
from the attached page images, reading tables and free text. Return ONLY a \
JSON object with this shape, no prose:\n\
{\n\
  \"metadata\": {\"patient_name\": str|null, \"document_name\": str|null, \
\"report_date\": \"YYYY-MM-DD\"|null, \"collection_date\": \"YYYY-MM-DD\"|null},\n\
  \"biomarkers\": [{\"name\": str, \"long_name\": str|null, \"short_name\": str|null, \
\"aliases\": [str], \"specimen\": str|null, \"panel\": str|null, \"confidence\": float, \
\"values\": [{\"value\": number|str, \"unit\": str|null, \"date\": \"YYYY-MM-DD\"|null, \
\"page\": int, \"name_box\": [x,y,w,h]|null, \"value_box\": [x,y,w,h]|null, \
\"unit_box\": [x,y,w,h]|null}]}]\n\
}\n\
Use the name exactly as printed. Report numeric values as numbers; keep \
qualitative results (\"Negative\", \"<0.1\") as strings. Page indices are \
zero-based in the order the images are attached. Include genetic markers \
(rsIDs) when present. Do not invent observations.";

// ──────────────────────────────────────────────
// Model trait + HTTP implementation
// ──────────────────────────────────────────────

/// Seam for the multimodal extraction model.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// One call covering all pages; returns the raw model text.
    async fn extract(
        &self,
        pages: &[PageImage],
        instruction: &str,
    ) -> Result<String, ExtractionError>;
}

/// Production client for a `generateContent`-style vision endpoint.
pub struct HttpVisionModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpVisionModel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl VisionModel for HttpVisionModel {
    async fn extract(
        &self,
        pages: &[PageImage],
        instruction: &str,
    ) -> Result<String, ExtractionError> {
        let start = std::time::Instant::now();

        let mut parts = vec![serde_json::json!({ "text": instruction })];
        for page in pages {
            parts.push(serde_json::json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": base64::engine::general_purpose::STANDARD.encode(&page.png),
                }
            }));
        }
        let body = serde_json::json!({ "contents": [{ "parts": parts }] });

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractionError::Model(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Model(format!(
                "endpoint returned {status}: {detail}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::MalformedResponse(format!("bad response body: {e}")))?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().find_map(|p| p.text))
            .ok_or_else(|| {
                ExtractionError::MalformedResponse("response has no text candidate".into())
            })?;

        tracing::info!(
            model = %self.model,
            pages = pages.len(),
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = text.len(),
            "vision extraction call complete"
        );
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

// ──────────────────────────────────────────────
// Response parsing
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    metadata: WireMetadata,
    #[serde(default)]
    biomarkers: Vec<WireBiomarker>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMetadata {
    patient_name: Option<String>,
    document_name: Option<String>,
    report_date: Option<NaiveDate>,
    collection_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct WireBiomarker {
    name: String,
    long_name: Option<String>,
    short_name: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    specimen: Option<String>,
    panel: Option<String>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    values: Vec<WireValue>,
}

#[derive(Debug, Deserialize)]
struct WireValue {
    value: ObservedValue,
    unit: Option<String>,
    date: Option<NaiveDate>,
    #[serde(default)]
    page: usize,
    name_box: Option<[u32; 4]>,
    value_box: Option<[u32; 4]>,
    unit_box: Option<[u32; 4]>,
}

fn location(page: usize, rect: Option<[u32; 4]>) -> Option<SourceLocation> {
    Some(SourceLocation {
        page,
        bounding_box: rect.map(|[x, y, width, height]| BoundingBox {
            x,
            y,
            width,
            height,
        }),
    })
}

/// Strip an optional ```json fence around the model output.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Parse the model's raw text into a [`PipelineResult`].
pub fn parse_extraction(raw: &str) -> Result<PipelineResult, ExtractionError> {
    let wire: WireResult = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| ExtractionError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let biomarkers = wire
        .biomarkers
        .into_iter()
        .filter(|b| !b.name.trim().is_empty())
        .map(|b| Biomarker {
            observed_name: b.name,
            long_name: b.long_name,
            short_name: b.short_name,
            aliases: b.aliases,
            values: b
                .values
                .into_iter()
                .map(|v| BiomarkerValue {
                    value: v.value,
                    unit: v.unit,
                    observed_at: v.date,
                    locations: FieldLocations {
                        name: location(v.page, v.name_box),
                        value: location(v.page, v.value_box),
                        unit: location(v.page, v.unit_box),
                    },
                })
                .collect(),
            confidence: b.confidence.clamp(0.0, 1.0),
            specimen: b.specimen,
            panel: b.panel,
            // Re-classified after name sanitization.
            kind: MarkerKind::Lab,
        })
        .collect();

    Ok(PipelineResult {
        biomarkers,
        metadata: DocumentMetadata {
            patient_name: wire.metadata.patient_name,
            document_name: wire.metadata.document_name,
            report_date: wire.metadata.report_date,
            collection_date: wire.metadata.collection_date,
        },
    })
}

// ──────────────────────────────────────────────
// Mock (testing)
// ──────────────────────────────────────────────

/// Scripted model: returns canned responses in order, then repeats the last.
#[cfg(test)]
pub struct MockVisionModel {
    responses: Vec<Result<String, String>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockVisionModel {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn replying(response: &str) -> Self {
        Self::new(vec![Ok(response.to_string())])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl VisionModel for MockVisionModel {
    async fn extract(
        &self,
        _pages: &[PageImage],
        _instruction: &str,
    ) -> Result<String, ExtractionError> {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let idx = n.min(self.responses.len().saturating_sub(1));
        match &self.responses[idx] {
            Ok(text) => Ok(text.clone()),
            Err(msg) => Err(ExtractionError::Model(msg.clone())),
        }
    }
}
