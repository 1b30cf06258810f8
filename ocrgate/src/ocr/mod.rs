//! OCR gateway
//!
//! One entry point for text extraction over interchangeable backends.
//!
//! # Architecture
//!
//! - `OcrBackend` trait defines what every backend provides
//! - `TesseractBackend` runs local OCR via leptess
//! - `VisionBackend` sends images to a hosted vision chat model (OpenAI, Mistral, DeepSeek)
//! - `ProviderRegistry` constructs backends lazily and caches them until cleanup
//! - `OcrOrchestrator` normalizes inputs, probes candidates, falls back in
//!   priority order and shapes the output into an `OcrResult`
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = OcrOrchestrator::from_env(ConfigLayer::default());
//! let result = orchestrator
//!     .perform_ocr(&[ImageInput::from_bytes(png)], &OcrOptions::default())
//!     .await?;
//! println!("{} ({}%)", result.text, result.confidence);
//! orchestrator.cleanup().await;
//! ```

mod api;
mod backend;
mod cache;
mod confidence;
mod normalize;
mod orchestrator;
mod preprocessing;
mod registry;
mod tesseract;
mod types;

/// Joins per-image text when a call covers several images.
pub const IMAGE_TEXT_SEPARATOR: &str = "\n\n";

pub use api::{VisionBackend, VisionChatClient, VisionVendor};
pub use backend::OcrBackend;
pub use cache::HandleCache;
pub use confidence::{
    aggregate, normalize_score, AggregatedConfidence, ScoreScale, VISION_ESTIMATED_CONFIDENCE,
};
pub use normalize::{
    detect_format, normalize_batch, normalize_image, NormalizeOutcome, NormalizedBatch,
    SkippedImage, MIN_IMAGE_BYTES,
};
pub use orchestrator::{OcrOrchestrator, OrchestratorHandle};
pub use preprocessing::{enhance_for_ocr, EnhancedImage};
pub use registry::ProviderRegistry;
pub use tesseract::{parse_tsv, TesseractBackend, TESSERACT};
pub use types::{
    split_languages, AttemptFailure, BoundingBox, CapabilitySummary, Detection, DetectionKind,
    ImageFormat, ImageInput, ImagePayload, ImageSource, NormalizedImage, OcrMetadata, OcrOptions,
    OcrResult, OutputFormat, PixelDims, ProbeResult, ProviderDescriptor, Recognition,
    RecognitionOptions,
};
