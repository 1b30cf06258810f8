use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use leptess::LepTess;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{OcrError, Result};

use super::backend::OcrBackend;
use super::cache::HandleCache;
use super::confidence::{normalize_score, ScoreScale};
use super::preprocessing::enhance_for_ocr;
use super::types::{
    split_languages, BoundingBox, CapabilitySummary, Detection, DetectionKind, ImageFormat,
    NormalizedImage, ProbeResult, Recognition, RecognitionOptions,
};
use super::IMAGE_TEXT_SEPARATOR;

pub const TESSERACT: &str = "tesseract";

/// TSV row level for single words.
const WORD_LEVEL: u32 = 5;

type Worker = Arc<Mutex<LepTess>>;

/// Outcome of a throwaway engine init, kept until cleanup.
type EngineCheck = std::result::Result<(), String>;

fn create_tesseract(
    data_path: Option<&str>,
    languages: &str,
) -> std::result::Result<LepTess, String> {
    LepTess::new(data_path, languages).map_err(|e| e.to_string())
}

/// Local tesseract engine. One worker is kept per language tag.
pub struct TesseractBackend {
    tessdata_path: Option<String>,
    workers: HandleCache<String, Worker>,
    engine_checks: HandleCache<String, EngineCheck>,
    engine_inits: AtomicUsize,
}

impl TesseractBackend {
    pub fn new(tessdata_path: Option<String>) -> Self {
        Self {
            tessdata_path,
            workers: HandleCache::new(),
            engine_checks: HandleCache::new(),
            engine_inits: AtomicUsize::new(0),
        }
    }

    /// Init a throwaway engine for `language` once; later calls reuse the outcome.
    async fn engine_check(&self, language: String) -> EngineCheck {
        let data_path = self.tessdata_path.clone();
        let inits = &self.engine_inits;
        self.engine_checks
            .get_or_init(language.clone(), || async move {
                inits.fetch_add(1, Ordering::SeqCst);
                tokio::task::spawn_blocking(move || {
                    create_tesseract(data_path.as_deref(), &language).map(|_| ())
                })
                .await
                .unwrap_or_else(|e| Err(format!("probe panicked: {e}")))
            })
            .await
    }

    fn language_key(language: &str) -> String {
        let codes = split_languages(language);
        if codes.is_empty() {
            "eng".to_string()
        } else {
            codes.join("+")
        }
    }

    async fn worker(&self, language: &str) -> Result<Worker> {
        let key = Self::language_key(language);

        let installed = self.supported_languages();
        if !installed.is_empty() {
            if let Some(missing) = split_languages(&key)
                .into_iter()
                .find(|code| !installed.iter().any(|l| l == code))
            {
                return Err(OcrError::unsupported(
                    TESSERACT,
                    format!("language '{missing}' (no traineddata installed)"),
                ));
            }
        }

        let data_path = self.tessdata_path.clone();
        let languages = key.clone();
        self.workers
            .get_or_try_init(key, || async move {
                let lt = tokio::task::spawn_blocking(move || {
                    create_tesseract(data_path.as_deref(), &languages).map(|lt| (lt, languages))
                })
                .await
                .map_err(|e| {
                    OcrError::processing(TESSERACT, format!("Worker setup panicked: {e}"))
                })?
                .map_err(|e| {
                    OcrError::dependency(TESSERACT, format!("Tesseract not available: {e}"))
                })?;

                info!(languages = %lt.1, "Tesseract worker initialized");
                Ok(Arc::new(Mutex::new(lt.0)))
            })
            .await
    }

    fn tessdata_dir(&self) -> Option<PathBuf> {
        self.tessdata_path.as_ref().map(PathBuf::from)
    }
}

/// Parse tesseract TSV output into word detections. Coordinates are divided
/// by `scale` so they refer to the caller's image.
pub fn parse_tsv(tsv: &str, image_index: usize, scale: f32) -> Vec<Detection> {
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let unscale = |v: u32| (v as f32 / scale).round() as u32;

    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 {
                return None;
            }
            let level: u32 = cols[0].parse().ok()?;
            if level != WORD_LEVEL {
                return None;
            }
            let text = cols[11..].join("\t");
            let text = text.trim();
            if text.is_empty() {
                return None;
            }

            let left: u32 = cols[6].parse().ok()?;
            let top: u32 = cols[7].parse().ok()?;
            let width: u32 = cols[8].parse().ok()?;
            let height: u32 = cols[9].parse().ok()?;
            let conf: f32 = cols[10].parse().ok()?;

            let mut detection = Detection::new(text, image_index)
                .with_kind(DetectionKind::Word)
                .with_bbox(BoundingBox {
                    x: unscale(left),
                    y: unscale(top),
                    width: unscale(width),
                    height: unscale(height),
                });
            detection.confidence = normalize_score(conf, ScoreScale::Percent);
            Some(detection)
        })
        .collect()
}

#[async_trait]
impl OcrBackend for TesseractBackend {
    fn name(&self) -> &str {
        TESSERACT
    }

    async fn recognize(
        &self,
        images: &[NormalizedImage],
        options: &RecognitionOptions,
    ) -> Result<Recognition> {
        let worker = self.worker(&options.language).await?;

        let mut texts = Vec::with_capacity(images.len());
        let mut detections = Vec::new();

        for image in images {
            let encoded = image
                .encoded()
                .map_err(|e| OcrError::processing(TESSERACT, e))?;

            let (bytes, scale) = if options.enhance_resolution {
                let enhanced =
                    enhance_for_ocr(&encoded).map_err(|e| OcrError::processing(TESSERACT, e))?;
                (enhanced.png, enhanced.scale)
            } else {
                (encoded.into_owned(), 1.0)
            };

            let worker = Arc::clone(&worker);
            let index = image.index;
            let (text, found) = tokio::task::spawn_blocking(move || {
                let mut lt = worker.blocking_lock();
                lt.set_image_from_mem(&bytes)
                    .map_err(|e| {
                        OcrError::processing(TESSERACT, format!("Failed to set image: {e}"))
                    })?;
                let text = lt.get_utf8_text().map_err(|e| {
                    OcrError::processing(TESSERACT, format!("Failed to extract text: {e}"))
                })?;
                let tsv = lt.get_tsv_text(0).map_err(|e| {
                    OcrError::processing(TESSERACT, format!("Failed to read word layout: {e}"))
                })?;
                Ok::<_, OcrError>((text, parse_tsv(&tsv, index, scale)))
            })
            .await
            .map_err(|e| OcrError::processing(TESSERACT, format!("OCR task panicked: {e}")))??;

            debug!(image = index, words = found.len(), "Tesseract recognized image");
            texts.push(text.trim().to_string());
            detections.extend(found);
        }

        Ok(Recognition {
            text: texts.join(IMAGE_TEXT_SEPARATOR),
            detections,
            estimated_confidence: None,
        })
    }

    /// A cached worker proves the engine works. Otherwise one throwaway init
    /// runs and its outcome is reused until cleanup.
    async fn probe(&self) -> ProbeResult {
        let languages = self.supported_languages();

        let result = if !self.workers.is_empty() {
            ProbeResult::available()
        } else {
            let probe_language = if languages.is_empty() || languages.iter().any(|l| l == "eng") {
                "eng".to_string()
            } else {
                languages[0].clone()
            };
            match self.engine_check(probe_language).await {
                Ok(()) => ProbeResult::available(),
                Err(e) => ProbeResult::unavailable(format!("Tesseract not available: {e}")),
            }
        };

        result
            .with_detail("languages", languages)
            .with_detail("tessdata_path", self.tessdata_path.clone())
            .with_detail("cached_workers", self.workers.len())
    }

    async fn capabilities(&self) -> CapabilitySummary {
        CapabilitySummary {
            languages: self.supported_languages(),
            formats: ImageFormat::ALL.to_vec(),
            max_image_bytes: None,
            bounding_boxes: true,
            native_confidence: true,
        }
    }

    /// Installed `*.traineddata` files; empty when no data directory is configured.
    fn supported_languages(&self) -> Vec<String> {
        let Some(dir) = self.tessdata_dir() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut languages: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("traineddata") {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|stem| *stem != "osd")
                    .map(str::to_string)
            })
            .collect();
        languages.sort();
        languages
    }

    async fn cleanup(&self) -> Result<()> {
        self.engine_checks.clear();
        let released = self.workers.clear();
        if !released.is_empty() {
            debug!(count = released.len(), "Released tesseract workers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE_TSV: &str = "1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t\n\
4\t1\t1\t1\t1\t0\t30\t60\t300\t40\t-1\t\n\
5\t1\t1\t1\t1\t1\t30\t60\t120\t40\t96.5\tHello\n\
5\t1\t1\t1\t1\t2\t180\t60\t150\t40\t88.0\tWorld\n\
5\t1\t1\t1\t1\t3\t340\t60\t10\t40\t-1\t \n";

    #[test]
    fn test_parse_tsv_words_only() {
        let detections = parse_tsv(SAMPLE_TSV, 0, 1.0);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].text, "Hello");
        assert_eq!(detections[0].confidence, Some(96.5));
        assert_eq!(
            detections[0].bbox,
            Some(BoundingBox {
                x: 30,
                y: 60,
                width: 120,
                height: 40
            })
        );
        assert_eq!(detections[1].kind, Some(DetectionKind::Word));
    }

    #[test]
    fn test_parse_tsv_maps_boxes_back_to_source() {
        let detections = parse_tsv(SAMPLE_TSV, 4, 2.0);
        assert_eq!(
            detections[1].bbox,
            Some(BoundingBox {
                x: 90,
                y: 30,
                width: 75,
                height: 20
            })
        );
        assert_eq!(detections[1].image_index, 4);
    }

    #[test]
    fn test_parse_tsv_ignores_header_and_garbage() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\t\
                   left\ttop\twidth\theight\tconf\ttext\nnot a row\n";
        assert!(parse_tsv(tsv, 0, 1.0).is_empty());
    }

    #[test]
    fn test_language_key_normalizes() {
        assert_eq!(TesseractBackend::language_key(""), "eng");
        assert_eq!(TesseractBackend::language_key(" jpn + eng "), "jpn+eng");
    }

    #[test]
    fn test_supported_languages_from_tessdata_dir() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["eng.traineddata", "jpn.traineddata", "osd.traineddata", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let backend = TesseractBackend::new(Some(dir.path().to_string_lossy().into_owned()));
        assert_eq!(backend.supported_languages(), vec!["eng", "jpn"]);
    }

    #[tokio::test]
    async fn test_missing_language_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("eng.traineddata"), b"").unwrap();
        let backend = TesseractBackend::new(Some(dir.path().to_string_lossy().into_owned()));

        let err = backend.worker("eng+kor").await.err().expect("expected an error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
        assert!(err.to_string().contains("kor"));
    }

    #[tokio::test]
    async fn test_probe_never_panics() {
        let dir = tempfile::tempdir().unwrap();
        let backend = TesseractBackend::new(Some(dir.path().to_string_lossy().into_owned()));
        let probe = backend.probe().await;
        if !probe.available {
            assert!(probe.reason.is_some());
        }
        assert!(probe.details.contains_key("languages"));
    }

    #[tokio::test]
    async fn test_repeated_probes_reuse_engine_check() {
        let dir = tempfile::tempdir().unwrap();
        let backend = TesseractBackend::new(Some(dir.path().to_string_lossy().into_owned()));

        let first = backend.probe().await;
        let second = backend.probe().await;
        assert_eq!(first.available, second.available);
        assert_eq!(first.reason, second.reason);
        assert_eq!(backend.engine_inits.load(Ordering::SeqCst), 1);

        backend.cleanup().await.unwrap();
        backend.probe().await;
        assert_eq!(backend.engine_inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let backend = TesseractBackend::new(None);
        backend.cleanup().await.unwrap();
        backend.cleanup().await.unwrap();
        assert!(backend.workers.is_empty());
    }
}
