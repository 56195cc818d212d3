//! Upload format validation.
//!
//! The declared MIME type is never trusted on its own: the magic bytes of
//! the payload must agree with it before the document is admitted.

use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// Supported input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Png,
    Jpeg,
}

impl DocumentFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(Self::Pdf),
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// Sniff the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF-") {
            Some(Self::Pdf)
        } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else {
            None
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Png | Self::Jpeg)
    }

    pub fn as_mime(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

/// An uploaded document: raw bytes plus what the client claimed about them.
#[derive(Debug, Clone)]
pub struct DocumentBlob {
    pub name: String,
    pub declared_mime: String,
    pub bytes: Vec<u8>,
}

impl DocumentBlob {
    pub fn new(name: impl Into<String>, declared_mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            declared_mime: declared_mime.into(),
            bytes,
        }
    }

    /// Validate declared MIME against the payload's magic bytes.
    ///
    /// Rejects unknown MIME types, unrecognizable payloads, and any
    /// disagreement between the two (a renamed .exe does not get through on
    /// its extension).
    pub fn validated_format(&self) -> Result<DocumentFormat, ExtractionError> {
        let declared =
            DocumentFormat::from_mime(&self.declared_mime).ok_or(ExtractionError::UnsupportedFormat {
                declared: self.declared_mime.clone(),
            })?;
        let sniffed = DocumentFormat::sniff(&self.bytes).ok_or(ExtractionError::UnsupportedFormat {
            declared: self.declared_mime.clone(),
        })?;
        if declared != sniffed {
            return Err(ExtractionError::UnsupportedFormat {
                declared: self.declared_mime.clone(),
            });
        }
        Ok(declared)
    }
}
