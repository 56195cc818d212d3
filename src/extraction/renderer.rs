//! PDF page-to-image rendering using lopdf.
//!
//! Scanned medical documents carry each page as an embedded image XObject
//! (JPEG or a decodable stream). We pull the largest image per page and
//! re-encode it to PNG for the vision model. Pages render concurrently on
//! the blocking pool, capped by the shared render semaphore, and come back
//! in page order.

use std::sync::Arc;

use futures_util::future::join_all;
use image::ImageFormat;
use lopdf::{Document, Object, ObjectId};
use tokio::sync::Semaphore;

use super::format::{DocumentBlob, DocumentFormat};
use super::ExtractionError;

/// One rendered page, PNG-encoded.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-based page index.
    pub number: usize,
    pub png: Vec<u8>,
}

/// Render an uploaded document into page images.
///
/// Images are a single page; PDFs are parsed once and fanned out per page.
pub async fn render_document(
    blob: &DocumentBlob,
    permits: Arc<Semaphore>,
) -> Result<Vec<PageImage>, ExtractionError> {
    match blob.validated_format()? {
        DocumentFormat::Pdf => render_pdf_pages(blob.bytes.clone(), permits).await,
        DocumentFormat::Png => Ok(vec![PageImage {
            number: 0,
            png: blob.bytes.clone(),
        }]),
        DocumentFormat::Jpeg => {
            let png = reencode_png(&blob.bytes)?;
            Ok(vec![PageImage { number: 0, png }])
        }
    }
}

async fn render_pdf_pages(
    pdf_bytes: Vec<u8>,
    permits: Arc<Semaphore>,
) -> Result<Vec<PageImage>, ExtractionError> {
    // Parse once; page extraction only reads.
    let doc = Arc::new(
        Document::load_mem(&pdf_bytes)
            .map_err(|e| ExtractionError::PdfParsing(format!("failed to parse PDF: {e}")))?,
    );
    let page_ids: Vec<ObjectId> = doc.page_iter().collect();
    if page_ids.is_empty() {
        return Err(ExtractionError::PdfParsing("PDF has no pages".into()));
    }

    let mut handles = Vec::with_capacity(page_ids.len());
    for (number, page_id) in page_ids.into_iter().enumerate() {
        let doc = Arc::clone(&doc);
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|_| ExtractionError::Cancelled)?;
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let png = render_page(&doc, page_id)?;
            tracing::debug!(page = number, png_size = png.len(), "rendered PDF page");
            Ok::<_, ExtractionError>(PageImage { number, png })
        }));
    }

    let mut pages = Vec::with_capacity(handles.len());
    for joined in join_all(handles).await {
        let page = joined
            .map_err(|e| ExtractionError::ImageProcessing(format!("render task panicked: {e}")))??;
        pages.push(page);
    }
    Ok(pages)
}

fn render_page(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>, ExtractionError> {
    let image_bytes = extract_largest_page_image(doc, page_id)?;
    reencode_png(&image_bytes)
}

/// Decode whatever image bytes we pulled out and normalize to PNG.
fn reencode_png(bytes: &[u8]) -> Result<Vec<u8>, ExtractionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::ImageProcessing(format!("failed to decode image: {e}")))?;
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("failed to encode PNG: {e}")))?;
    Ok(buf.into_inner())
}

/// Extract the largest image XObject from a PDF page.
///
/// Walks: page dict -> /Resources -> /XObject -> /Subtype /Image entries.
/// The largest image is the main page scan.
fn extract_largest_page_image(
    doc: &Document,
    page_id: ObjectId,
) -> Result<Vec<u8>, ExtractionError> {
    let page_dict = doc
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(|e| ExtractionError::PdfParsing(format!("bad page object: {e}")))?;

    let resources = resolve_dict_entry(doc, page_dict, b"Resources")?;
    let xobjects = resolve_dict_entry(doc, resources, b"XObject")?;

    let mut largest: Option<Vec<u8>> = None;

    for (_name, obj_ref) in xobjects.iter() {
        let xobj = resolve_object(doc, obj_ref);
        let stream = match xobj {
            Object::Stream(ref s) => s,
            _ => continue,
        };
        if !is_image_subtype(&stream.dict) {
            continue;
        }
        let Some(image_bytes) = extract_image_bytes(stream) else {
            continue;
        };
        if largest.as_ref().map_or(true, |prev| image_bytes.len() > prev.len()) {
            largest = Some(image_bytes);
        }
    }

    largest
        .ok_or_else(|| ExtractionError::PdfParsing("no image XObjects found on this page".into()))
}

fn is_image_subtype(dict: &lopdf::Dictionary) -> bool {
    dict.get(b"Subtype")
        .map(|obj| matches!(obj, Object::Name(ref n) if n == b"Image"))
        .unwrap_or(false)
}

/// Pull decodable image bytes out of a PDF stream, or `None` when the
/// stream holds raw pixel data we cannot interpret.
fn extract_image_bytes(stream: &lopdf::Stream) -> Option<Vec<u8>> {
    let is_dct = stream
        .dict
        .get(b"Filter")
        .map(|f| match f {
            Object::Name(n) => n == b"DCTDecode",
            Object::Array(arr) => arr
                .iter()
                .any(|o| matches!(o, Object::Name(ref n) if n == b"DCTDecode")),
            _ => false,
        })
        .unwrap_or(false);

    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());

    if is_dct {
        // DCTDecode stream content is the JPEG file itself.
        return Some(content);
    }

    // Some streams contain full image files (TIFF, PNG) behind FlateDecode.
    if image::load_from_memory(&content).is_ok() {
        return Some(content);
    }
    None
}

fn resolve_object<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

fn resolve_dict_entry<'a>(
    doc: &'a Document,
    dict: &'a lopdf::Dictionary,
    key: &[u8],
) -> Result<&'a lopdf::Dictionary, ExtractionError> {
    let obj = dict.get(key).map_err(|_| {
        ExtractionError::PdfParsing(format!("missing /{}", String::from_utf8_lossy(key)))
    })?;
    resolve_object(doc, obj).as_dict().map_err(|_| {
        ExtractionError::PdfParsing(format!("/{} is not a dictionary", String::from_utf8_lossy(key)))
    })
}
