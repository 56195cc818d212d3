//! Pipeline-internal biomarker types.
//!
//! A `Biomarker` is created by the extraction engine for one document and
//! consumed (then discarded) by the reconciliation engine. Nothing here is
//! persisted directly — the graph records in [`crate::model::graph`] are the
//! durable shape.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A value as observed on the document: numeric when it parses, verbatim
/// text otherwise (e.g. "Negative", "<0.1").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservedValue {
    Numeric(f64),
    Text(String),
}

impl ObservedValue {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// Stable string form used as a deduplication key component.
    pub fn canonical(&self) -> String {
        match self {
            Self::Numeric(n) => format!("{n}"),
            Self::Text(t) => t.trim().to_lowercase(),
        }
    }
}

impl std::fmt::Display for ObservedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

/// Bounding box on a rendered page, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Where on the source document a field was read (for citation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Zero-based page index.
    pub page: usize,
    pub bounding_box: Option<BoundingBox>,
}

/// Per-field source locations for one observed value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldLocations {
    pub name: Option<SourceLocation>,
    pub value: Option<SourceLocation>,
    pub unit: Option<SourceLocation>,
}

/// A single observation of a biomarker, owned by its parent [`Biomarker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiomarkerValue {
    pub value: ObservedValue,
    pub unit: Option<String>,
    pub observed_at: Option<NaiveDate>,
    #[serde(default)]
    pub locations: FieldLocations,
}

/// Lab analytes and genetic identifiers are flagged distinctly so the
/// reconciliation layer does not try to range-label rsID records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Lab,
    Genetic,
}

/// A biomarker extracted from one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Biomarker {
    /// Name exactly as printed on the document (post text-sanitization).
    pub observed_name: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub values: Vec<BiomarkerValue>,
    /// Extraction confidence (0.0-1.0).
    pub confidence: f32,
    pub specimen: Option<String>,
    pub panel: Option<String>,
    pub kind: MarkerKind,
}

impl Biomarker {
    /// All names this biomarker is known by on the document, observed name first.
    pub fn known_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![self.observed_name.as_str()];
        if let Some(long) = &self.long_name {
            names.push(long);
        }
        if let Some(short) = &self.short_name {
            names.push(short);
        }
        names.extend(self.aliases.iter().map(String::as_str));
        names
    }
}

/// Document-level metadata extracted alongside the biomarkers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub patient_name: Option<String>,
    pub document_name: Option<String>,
    pub report_date: Option<NaiveDate>,
    pub collection_date: Option<NaiveDate>,
}

impl DocumentMetadata {
    /// Date to fall back to when an individual value carries no date.
    /// Collection date wins over report date (closer to the draw).
    pub fn default_observation_date(&self) -> Option<NaiveDate> {
        self.collection_date.or(self.report_date)
    }
}

/// Output of the extraction engine for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub biomarkers: Vec<Biomarker>,
    pub metadata: DocumentMetadata,
}
