//! Input normalization: turns whatever the caller handed over into payloads a
//! backend can consume, or a skip decision that leaves the rest of the batch
//! intact.

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, warn};

use crate::error::{OcrError, Result};

use super::types::{ImageFormat, ImageInput, ImagePayload, ImageSource, NormalizedImage, PixelDims};

/// Anything shorter cannot be a decodable image, whatever its magic bytes say.
pub const MIN_IMAGE_BYTES: usize = 100;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedImage {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum NormalizeOutcome {
    Ready(NormalizedImage),
    Skipped(SkippedImage),
}

#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub images: Vec<NormalizedImage>,
    pub skipped: Vec<SkippedImage>,
}

/// Classify encoded bytes by their leading signature.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&PNG_SIGNATURE) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(&JPEG_SOI) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else if bytes.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else {
        None
    }
}

/// Normalize one input. Never fails; rejection is a [`NormalizeOutcome::Skipped`].
pub fn normalize_image(index: usize, input: &ImageInput) -> NormalizeOutcome {
    let skip = |reason: String| NormalizeOutcome::Skipped(SkippedImage { index, reason });

    let (bytes, declared) = match &input.source {
        ImageSource::Pixels {
            data,
            width,
            height,
            channels,
        } => {
            return match (width, height, channels) {
                (Some(width), Some(height), Some(channels)) => {
                    NormalizeOutcome::Ready(NormalizedImage {
                        index,
                        payload: ImagePayload::Raw {
                            data: data.clone(),
                            dims: PixelDims {
                                width: *width,
                                height: *height,
                                channels: *channels,
                            },
                        },
                        metadata: input.metadata.clone(),
                    })
                }
                _ => skip("raw pixels require width, height and channels together".to_string()),
            };
        }
        ImageSource::Bytes(bytes) => (bytes.clone(), input.format_hint),
        ImageSource::Text(text) => match decode_text(text) {
            Ok((bytes, mime_format)) => (bytes, input.format_hint.or(mime_format)),
            Err(reason) => return skip(reason),
        },
    };

    if bytes.len() < MIN_IMAGE_BYTES {
        return skip(format!(
            "input too small: {} bytes, minimum {MIN_IMAGE_BYTES}",
            bytes.len()
        ));
    }

    let Some(format) = detect_format(&bytes) else {
        let guessed = infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return skip(format!("unsupported image signature (looks like {guessed})"));
    };

    if let Some(hint) = declared {
        if hint != format {
            debug!(
                index,
                declared = ?hint,
                detected = ?format,
                "Declared image format disagrees with signature, using detected format"
            );
        }
    }

    NormalizeOutcome::Ready(NormalizedImage {
        index,
        payload: ImagePayload::Encoded { bytes, format },
        metadata: input.metadata.clone(),
    })
}

/// Normalize every input in order. Errors only when nothing usable is left.
pub fn normalize_batch(inputs: &[ImageInput]) -> Result<NormalizedBatch> {
    let mut images = Vec::with_capacity(inputs.len());
    let mut skipped = Vec::new();

    for (index, input) in inputs.iter().enumerate() {
        match normalize_image(index, input) {
            NormalizeOutcome::Ready(image) => images.push(image),
            NormalizeOutcome::Skipped(skip) => {
                warn!(index = skip.index, reason = %skip.reason, "Skipping image");
                skipped.push(skip);
            }
        }
    }

    if images.is_empty() {
        return Err(OcrError::NoUsableInput {
            skipped: skipped
                .iter()
                .map(|s| format!("image {}: {}", s.index, s.reason))
                .collect(),
        });
    }

    Ok(NormalizedBatch { images, skipped })
}

fn decode_text(text: &str) -> std::result::Result<(Vec<u8>, Option<ImageFormat>), String> {
    let trimmed = text.trim();

    if let Some(rest) = trimmed.strip_prefix("data:") {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| "malformed data URL: missing ',' separator".to_string())?;
        let Some(mime) = header.strip_suffix(";base64") else {
            return Err("data URL is not base64-encoded".to_string());
        };
        let bytes = decode_base64(payload).map_err(|e| format!("invalid data URL payload: {e}"))?;
        return Ok((bytes, ImageFormat::from_mime_type(mime)));
    }

    let bytes = decode_base64(trimmed).map_err(|e| format!("invalid base64 image text: {e}"))?;
    Ok((bytes, None))
}

fn decode_base64(payload: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact)
}
