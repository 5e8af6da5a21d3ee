//! Inbound attachment handling: two-tier image transcoding and document
//! block construction.
//!
//! Images are transcoded on entry into an inference tier (~1200px JPEG for
//! the LLM call) and a storage tier (~512px WebP for persistence).

use base64::Engine;
use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use mira_domain::message::{BlockSource, ContentBlock};
use mira_domain::{Error, Result};

const INFERENCE_MAX_DIM: u32 = 1200;
const STORAGE_MAX_DIM: u32 = 512;

#[derive(Debug)]
pub struct ImageTiers {
    pub inference: ContentBlock,
    pub storage: ContentBlock,
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Decode, validate, and transcode an uploaded image into both tiers.
pub fn transcode_image(
    data_b64: &str,
    mime: &str,
    max_bytes: usize,
    allowlist: &[String],
) -> Result<ImageTiers> {
    if !allowlist.iter().any(|m| m == mime) {
        return Err(Error::Validation(format!("image type not allowed: {mime}")));
    }
    let raw = b64()
        .decode(data_b64.trim())
        .map_err(|e| Error::Validation(format!("invalid base64 image data: {e}")))?;
    if raw.len() > max_bytes {
        return Err(Error::Validation(format!(
            "image exceeds the {} MB limit",
            max_bytes / (1024 * 1024)
        )));
    }

    let decoded = image::load_from_memory(&raw)
        .map_err(|e| Error::Validation(format!("could not decode image: {e}")))?;

    let inference = encode_jpeg(&resize(&decoded, INFERENCE_MAX_DIM))?;
    let storage = encode_webp(&resize(&decoded, STORAGE_MAX_DIM))?;

    Ok(ImageTiers {
        inference: ContentBlock::Image {
            source: BlockSource::base64("image/jpeg", b64().encode(inference)),
        },
        storage: ContentBlock::Image {
            source: BlockSource::base64("image/webp", b64().encode(storage)),
        },
    })
}

fn resize(img: &DynamicImage, max_dim: u32) -> DynamicImage {
    if img.width() <= max_dim && img.height() <= max_dim {
        return img.clone();
    }
    img.resize(max_dim, max_dim, FilterType::Lanczos3)
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    // JPEG has no alpha channel.
    DynamicImage::ImageRgb8(img.to_rgb8())
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| Error::Validation(format!("image transcode failed: {e}")))?;
    Ok(out.into_inner())
}

fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::WebP)
        .map_err(|e| Error::Validation(format!("image transcode failed: {e}")))?;
    Ok(out.into_inner())
}

/// Build a content block for an uploaded document.
///
/// PDFs pass through as base64 document blocks. Text-bearing formats fall
/// back to inline extracted text. Spreadsheet/word formats need the Files
/// upload handle, which this deployment does not provision.
pub fn document_block(
    data_b64: &str,
    mime: &str,
    max_bytes: usize,
    allowlist: &[String],
) -> Result<ContentBlock> {
    if !allowlist.iter().any(|m| m == mime) {
        return Err(Error::Validation(format!("document type not allowed: {mime}")));
    }
    let raw = b64()
        .decode(data_b64.trim())
        .map_err(|e| Error::Validation(format!("invalid base64 document data: {e}")))?;
    if raw.len() > max_bytes {
        return Err(Error::Validation(format!(
            "document exceeds the {} MB limit",
            max_bytes / (1024 * 1024)
        )));
    }

    match mime {
        "application/pdf" => Ok(ContentBlock::Document {
            source: BlockSource::base64(mime, data_b64.trim().to_string()),
        }),
        "text/csv" | "application/json" | "text/plain" => {
            let text = String::from_utf8(raw)
                .map_err(|_| Error::Validation("document is not valid UTF-8 text".into()))?;
            Ok(ContentBlock::text(format!("[Uploaded document]\n{text}")))
        }
        other => Err(Error::Validation(format!(
            "document type {other} requires the Files upload pipeline, which is not configured"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> String {
        // A 4x4 red PNG, generated once and inlined.
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 0, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img).write_to(&mut out, ImageFormat::Png).unwrap();
        b64().encode(out.into_inner())
    }

    fn allow_images() -> Vec<String> {
        vec!["image/png".into(), "image/jpeg".into()]
    }

    #[test]
    fn transcodes_to_both_tiers() {
        let tiers =
            transcode_image(&tiny_png(), "image/png", 5 * 1024 * 1024, &allow_images()).unwrap();
        match tiers.inference {
            ContentBlock::Image { source } => assert_eq!(source.media_type, "image/jpeg"),
            other => panic!("expected image block, got {other:?}"),
        }
        match tiers.storage {
            ContentBlock::Image { source } => assert_eq!(source.media_type, "image/webp"),
            other => panic!("expected image block, got {other:?}"),
        }
    }

    #[test]
    fn rejects_disallowed_mime() {
        let err = transcode_image(&tiny_png(), "image/tiff", 1024, &allow_images()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_oversized() {
        let err = transcode_image(&tiny_png(), "image/png", 10, &allow_images()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_bad_base64() {
        let err =
            transcode_image("not-base64!!!", "image/png", 1024, &allow_images()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn pdf_passes_as_document_block() {
        let allow = vec!["application/pdf".into()];
        let data = b64().encode(b"%PDF-1.4 fake");
        let block = document_block(&data, "application/pdf", 1024, &allow).unwrap();
        assert!(matches!(block, ContentBlock::Document { .. }));
    }

    #[test]
    fn csv_falls_back_to_text() {
        let allow = vec!["text/csv".into()];
        let data = b64().encode(b"a,b\n1,2");
        let block = document_block(&data, "text/csv", 1024, &allow).unwrap();
        match block {
            ContentBlock::Text { text, .. } => assert!(text.contains("a,b")),
            other => panic!("expected text block, got {other:?}"),
        }
    }
}
