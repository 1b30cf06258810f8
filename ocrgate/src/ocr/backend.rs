use async_trait::async_trait;

use crate::error::Result;

use super::types::{
    CapabilitySummary, NormalizedImage, ProbeResult, Recognition, RecognitionOptions,
};

/// Contract every OCR backend implements.
///
/// `probe` must never fail or panic; every problem is folded into
/// `ProbeResult { available: false, reason }`. `recognize` returns classified
/// errors so the orchestrator can decide whether to move on.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Unique registry key.
    fn name(&self) -> &str;

    async fn recognize(
        &self,
        images: &[NormalizedImage],
        options: &RecognitionOptions,
    ) -> Result<Recognition>;

    async fn probe(&self) -> ProbeResult;

    async fn capabilities(&self) -> CapabilitySummary;

    /// Languages this backend can serve. Empty means unrestricted.
    fn supported_languages(&self) -> Vec<String>;

    /// Release cached handles. Must be safe to call repeatedly.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
