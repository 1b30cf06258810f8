use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Encodings recognised by signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 5] = [
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Gif,
        ImageFormat::Webp,
        ImageFormat::Bmp,
    ];

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Bmp => "image/bmp",
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/gif" => Some(ImageFormat::Gif),
            "image/webp" => Some(ImageFormat::Webp),
            "image/bmp" | "image/x-ms-bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }
}

/// Raw image content as handed over by the caller.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Encoded file bytes (PNG, JPEG, ...).
    Bytes(Vec<u8>),
    /// A `data:` URL or bare base64 text.
    Text(String),
    /// Undecoded pixels; dimensions must be supplied together.
    Pixels {
        data: Vec<u8>,
        width: Option<u32>,
        height: Option<u32>,
        channels: Option<u8>,
    },
}

/// One unit of OCR input.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub source: ImageSource,
    pub format_hint: Option<ImageFormat>,
    pub metadata: HashMap<String, Value>,
}

impl ImageInput {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(ImageSource::Bytes(bytes.into()))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(ImageSource::Text(text.into()))
    }

    pub fn from_pixels(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self::new(ImageSource::Pixels {
            data,
            width: Some(width),
            height: Some(height),
            channels: Some(channels),
        })
    }

    fn new(source: ImageSource) -> Self {
        Self {
            source,
            format_hint: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_format_hint(mut self, format: ImageFormat) -> Self {
        self.format_hint = Some(format);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDims {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// Validated payload a backend can consume.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    Encoded { bytes: Vec<u8>, format: ImageFormat },
    Raw { data: Vec<u8>, dims: PixelDims },
}

/// Output of the normalizer for one accepted input.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    /// Position of this image in the caller's input list.
    pub index: usize,
    pub payload: ImagePayload,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Structured,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(OutputFormat::Text),
            "structured" | "json" => Ok(OutputFormat::Structured),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

/// Fully resolved per-call options passed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOptions {
    /// `+`-joined language codes, e.g. `eng+jpn`.
    pub language: String,
    pub min_confidence: f32,
    pub output: OutputFormat,
    pub timeout: Duration,
    pub enhance_resolution: bool,
}

impl RecognitionOptions {
    /// Individual language codes in order. Empty segments are dropped.
    pub fn languages(&self) -> Vec<&str> {
        split_languages(&self.language)
    }
}

pub fn split_languages(tag: &str) -> Vec<&str> {
    tag.split('+')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .collect()
}

/// Caller-supplied per-call overrides. `None` means "use the effective default".
#[derive(Debug, Clone, Default)]
pub struct OcrOptions {
    pub provider: Option<String>,
    pub allow_fallback: Option<bool>,
    pub language: Option<String>,
    pub min_confidence: Option<f32>,
    pub output: Option<OutputFormat>,
    pub timeout: Option<Duration>,
    pub enhance_resolution: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Heading,
    Paragraph,
    Line,
    Word,
}

/// One recognised text unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub text: String,
    /// 0-100, `None` when the backend has no per-unit signal.
    pub confidence: Option<f32>,
    pub bbox: Option<BoundingBox>,
    pub kind: Option<DetectionKind>,
    pub image_index: usize,
}

impl Detection {
    pub fn new(text: impl Into<String>, image_index: usize) -> Self {
        Self {
            text: text.into(),
            confidence: None,
            bbox: None,
            kind: None,
            image_index,
        }
    }

    pub fn with_confidence(mut self, value: f32) -> Self {
        self.confidence = Some(value);
        self
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_kind(mut self, kind: DetectionKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// What a backend hands back before the orchestrator shapes it.
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    pub text: String,
    pub detections: Vec<Detection>,
    /// Placeholder overall score for backends without native confidence.
    pub estimated_confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrMetadata {
    pub provider: String,
    pub processing_time_ms: u64,
    pub language: String,
    pub fallback_from: Option<String>,
    pub failures: Vec<AttemptFailure>,
    pub skipped_images: Vec<usize>,
    pub confidence_estimated: bool,
}

/// Canonical result shape, identical for every backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f32,
    pub detections: Vec<Detection>,
    pub metadata: OcrMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeResult {
    pub available: bool,
    pub reason: Option<String>,
    pub details: serde_json::Map<String, Value>,
}

impl ProbeResult {
    pub fn available() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySummary {
    /// Empty means the backend accepts any language tag.
    pub languages: Vec<String>,
    pub formats: Vec<ImageFormat>,
    pub max_image_bytes: Option<usize>,
    pub bounding_boxes: bool,
    pub native_confidence: bool,
}

/// Registry entry as reported by `list_providers`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub probe: ProbeResult,
    pub capabilities: Option<CapabilitySummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_languages_preserves_order_and_duplicates() {
        assert_eq!(split_languages("jpn+eng+jpn"), vec!["jpn", "eng", "jpn"]);
        assert_eq!(split_languages(" eng + "), vec!["eng"]);
        assert!(split_languages("").is_empty());
    }

    #[test]
    fn test_mime_round_trip_for_all_formats() {
        for format in ImageFormat::ALL {
            assert_eq!(ImageFormat::from_mime_type(format.mime_type()), Some(format));
        }
        assert_eq!(ImageFormat::from_mime_type("image/jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_mime_type("text/plain"), None);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("Structured".parse::<OutputFormat>(), Ok(OutputFormat::Structured));
        assert_eq!("plain".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
