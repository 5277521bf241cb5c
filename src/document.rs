//! Uploaded document decoding
//!
//! Turns a `(file_name, base64 payload)` pair into either OCR-able pages or,
//! for DOCX, text lines read straight from the document.

use crate::error::OcrError;
use crate::ocr::Page;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use lopdf::{Document, Object, Stream};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// File suffixes accepted as single images
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif", "webp"];

/// Every accepted file suffix
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif", "webp", "pdf", "docx",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Image,
    Pdf,
    Docx,
}

impl DocumentKind {
    /// Classify by lower-cased file suffix
    pub fn from_file_name(file_name: &str) -> Result<Self, OcrError> {
        let suffix = Path::new(file_name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match suffix.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            s if IMAGE_EXTENSIONS.contains(&s) => Ok(Self::Image),
            "" => Err(OcrError::UnsupportedFormat(format!(
                "'{}' has no file extension",
                file_name
            ))),
            other => Err(OcrError::UnsupportedFormat(format!(".{}", other))),
        }
    }
}

/// What a decoded upload hands to the caller
pub enum DecodedDocument {
    /// Pages to OCR. Holds the spooled upload alive so path-mode
    /// invocations can read it.
    Pages {
        pages: Vec<Page>,
        _spool: Option<NamedTempFile>,
    },
    /// Text read directly from the document, no OCR needed
    Lines(Vec<String>),
}

/// Decode an upload according to its file name
pub fn decode(file_name: &str, bytes: &[u8]) -> Result<DecodedDocument, OcrError> {
    match DocumentKind::from_file_name(file_name)? {
        DocumentKind::Image => {
            let image = decode_image(bytes)?;
            let (page, spool) = match spool(file_name, bytes) {
                Ok(file) => (Page::from_file(image, file.path()), Some(file)),
                Err(e) => {
                    tracing::warn!("Could not spool upload to disk, path input disabled: {}", e);
                    (Page::new(image), None)
                }
            };
            Ok(DecodedDocument::Pages {
                pages: vec![page],
                _spool: spool,
            })
        }
        DocumentKind::Pdf => Ok(DecodedDocument::Pages {
            pages: pdf_pages(bytes)?.into_iter().map(Page::new).collect(),
            _spool: None,
        }),
        DocumentKind::Docx => Ok(DecodedDocument::Lines(extract_docx_lines(bytes)?)),
    }
}

/// Decode standard base64, tolerating surrounding whitespace
pub fn decode_base64(data: &str) -> Result<Vec<u8>, OcrError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| OcrError::InvalidPayload(format!("Invalid base64 payload: {}", e)))
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, OcrError> {
    image::load_from_memory(bytes)
        .map_err(|e| OcrError::InvalidPayload(format!("Unsupported image format: {}", e)))
}

/// Write the upload to a temp file keeping its suffix
fn spool(file_name: &str, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let suffix = Path::new(file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    let mut file = tempfile::Builder::new().suffix(&suffix).tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

/// Raster pages of a PDF, taken from its embedded image XObjects in
/// object order
pub fn pdf_pages(bytes: &[u8]) -> Result<Vec<DynamicImage>, OcrError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| OcrError::InvalidPayload(format!("Failed to read PDF: {}", e)))?;

    let mut images = Vec::new();
    for (object_id, object) in doc.objects.iter() {
        let Ok(stream) = object.as_stream() else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .map(|name| name == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        match image_from_stream(&doc, stream) {
            Ok(img) => images.push(img),
            Err(e) => tracing::warn!("Skipping image object {:?}: {}", object_id, e),
        }
    }

    if images.is_empty() {
        return Err(OcrError::NoPages);
    }
    tracing::debug!("Extracted {} page images from PDF", images.len());
    Ok(images)
}

fn stream_filters(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn image_from_stream(doc: &Document, stream: &Stream) -> anyhow::Result<DynamicImage> {
    let filters = stream_filters(stream);
    if filters.iter().any(|f| f.as_slice() == b"DCTDecode") {
        return Ok(image::load_from_memory_with_format(
            &stream.content,
            image::ImageFormat::Jpeg,
        )?);
    }

    let dimension = |key: &[u8]| -> anyhow::Result<u32> {
        let value = stream.dict.get(key).and_then(Object::as_i64)?;
        u32::try_from(value).map_err(|_| anyhow::anyhow!("Invalid image dimension {}", value))
    };
    let width = dimension(b"Width")?;
    let height = dimension(b"Height")?;
    let bits = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);
    if bits != 8 {
        anyhow::bail!("Unsupported bits per component: {}", bits);
    }

    let data = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.decompressed_content()?
    };
    let pixels = (width as usize) * (height as usize);
    let color_space = color_space(doc, stream);

    let image = match color_space.as_str() {
        "DeviceGray" | "CalGray" if data.len() >= pixels => {
            image::GrayImage::from_raw(width, height, data[..pixels].to_vec())
                .map(DynamicImage::ImageLuma8)
        }
        "DeviceRGB" | "CalRGB" | "ICCBased" if data.len() >= pixels * 3 => {
            image::RgbImage::from_raw(width, height, data[..pixels * 3].to_vec())
                .map(DynamicImage::ImageRgb8)
        }
        "DeviceCMYK" if data.len() >= pixels * 4 => {
            let rgb = data[..pixels * 4]
                .chunks_exact(4)
                .flat_map(|px| {
                    let k = 1.0 - px[3] as f32 / 255.0;
                    [0, 1, 2].map(|i| ((1.0 - px[i] as f32 / 255.0) * k * 255.0) as u8)
                })
                .collect();
            image::RgbImage::from_raw(width, height, rgb).map(DynamicImage::ImageRgb8)
        }
        other => anyhow::bail!(
            "Unsupported color space {} for {} bytes of {}x{} data",
            other,
            data.len(),
            width,
            height
        ),
    };
    image.ok_or_else(|| anyhow::anyhow!("Invalid {} image data", color_space))
}

/// Color space family name, following references and `[/ICCBased ...]`
/// style arrays
fn color_space(doc: &Document, stream: &Stream) -> String {
    fn family(object: &Object) -> Option<String> {
        match object {
            Object::Name(name) => Some(String::from_utf8_lossy(name).to_string()),
            Object::Array(items) => items.first().and_then(family),
            _ => None,
        }
    }

    let Ok(object) = stream.dict.get(b"ColorSpace") else {
        return "DeviceRGB".to_string();
    };
    let resolved = match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    };
    resolved
        .and_then(family)
        .unwrap_or_else(|| "DeviceRGB".to_string())
}

/// Paragraph lines followed by one tab-joined line per table row.
/// Blank paragraphs and cells are dropped.
pub fn extract_docx_lines(bytes: &[u8]) -> Result<Vec<String>, OcrError> {
    let docx = docx_rs::read_docx(bytes)
        .map_err(|e| OcrError::InvalidPayload(format!("Failed to read DOCX file: {}", e)))?;

    let mut paragraphs = Vec::new();
    let mut rows = Vec::new();
    for child in &docx.document.children {
        match child {
            docx_rs::DocumentChild::Paragraph(paragraph) => {
                let text = paragraph_text(paragraph);
                let text = text.trim();
                if !text.is_empty() {
                    paragraphs.push(text.to_string());
                }
            }
            docx_rs::DocumentChild::Table(table) => rows.extend(table_rows(table)),
            _ => {}
        }
    }

    paragraphs.extend(rows);
    if paragraphs.is_empty() {
        return Err(OcrError::NoTextProduced);
    }
    Ok(paragraphs)
}

fn paragraph_text(paragraph: &docx_rs::Paragraph) -> String {
    let mut content = String::new();
    for para_child in &paragraph.children {
        if let docx_rs::ParagraphChild::Run(run) = para_child {
            for run_child in &run.children {
                match run_child {
                    docx_rs::RunChild::Text(text) => content.push_str(&text.text),
                    docx_rs::RunChild::Tab(_) => content.push('\t'),
                    _ => {}
                }
            }
        }
    }
    content
}

fn table_rows(table: &docx_rs::Table) -> Vec<String> {
    let mut lines = Vec::new();
    for table_child in &table.rows {
        let docx_rs::TableChild::TableRow(row) = table_child;
        let cells: Vec<String> = row
            .cells
            .iter()
            .map(|row_child| {
                let docx_rs::TableRowChild::TableCell(cell) = row_child;
                cell.children
                    .iter()
                    .filter_map(|content| match content {
                        docx_rs::TableCellContent::Paragraph(p) => Some(paragraph_text(p)),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            })
            .filter(|cell| !cell.is_empty())
            .collect();
        if !cells.is_empty() {
            lines.push(cells.join("\t"));
        }
    }
    lines
}
