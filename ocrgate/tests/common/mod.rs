#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ocrgate::config::{EffectiveConfig, ProviderSelection};
use ocrgate::error::{OcrError, Result};
use ocrgate::ocr::{
    CapabilitySummary, Detection, ImageFormat, ImageInput, NormalizedImage, OcrBackend, ProbeResult,
    ProviderRegistry, Recognition, RecognitionOptions,
};

/// Bytes that pass signature detection as PNG and clear the minimum size.
pub fn png_like() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.resize(256, 0);
    bytes
}

pub fn png_input() -> ImageInput {
    ImageInput::from_bytes(png_like())
}

/// What a scripted backend does when asked to recognize.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed {
        text: String,
        detections: Vec<Detection>,
        estimated: Option<f32>,
    },
    Fail(ScriptedFailure),
    Hang(Duration),
}

#[derive(Debug, Clone, Copy)]
pub enum ScriptedFailure {
    Dependency,
    Processing,
    Unsupported,
}

impl Script {
    pub fn text(text: &str) -> Self {
        Script::Succeed {
            text: text.to_string(),
            detections: vec![Detection::new(text, 0).with_confidence(90.0)],
            estimated: None,
        }
    }
}

/// Test backend with scripted availability and behavior. Counts calls.
pub struct ScriptedBackend {
    name: String,
    available: bool,
    script: Script,
    languages: Vec<String>,
    probe_delay: Option<Duration>,
    pub recognize_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub cleanup_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            script,
            languages: Vec::new(),
            probe_delay: None,
            recognize_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_languages(mut self, languages: &[&str]) -> Self {
        self.languages = languages.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.recognize_calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(
        &self,
        images: &[NormalizedImage],
        _options: &RecognitionOptions,
    ) -> Result<Recognition> {
        self.recognize_calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed {
                text,
                detections,
                estimated,
            } => Ok(Recognition {
                text: text.clone(),
                detections: detections
                    .iter()
                    .cloned()
                    .map(|mut d| {
                        d.image_index = images.first().map(|i| i.index).unwrap_or(0);
                        d
                    })
                    .collect(),
                estimated_confidence: *estimated,
            }),
            Script::Fail(ScriptedFailure::Dependency) => {
                Err(OcrError::dependency(&self.name, "scripted dependency failure"))
            }
            Script::Fail(ScriptedFailure::Processing) => {
                Err(OcrError::processing(&self.name, "scripted processing failure"))
            }
            Script::Fail(ScriptedFailure::Unsupported) => {
                Err(OcrError::unsupported(&self.name, "scripted unsupported input"))
            }
            Script::Hang(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(Recognition {
                    text: "too late".to_string(),
                    detections: Vec::new(),
                    estimated_confidence: None,
                })
            }
        }
    }

    async fn probe(&self) -> ProbeResult {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        if self.available {
            ProbeResult::available()
        } else {
            ProbeResult::unavailable(format!("{} is switched off", self.name))
        }
    }

    async fn capabilities(&self) -> CapabilitySummary {
        CapabilitySummary {
            languages: self.languages.clone(),
            formats: ImageFormat::ALL.to_vec(),
            max_image_bytes: None,
            bounding_boxes: false,
            native_confidence: true,
        }
    }

    fn supported_languages(&self) -> Vec<String> {
        self.languages.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry holding `backends` in the given order, plus a config whose
/// fallback order matches it.
pub fn scripted(backends: &[Arc<ScriptedBackend>]) -> (EffectiveConfig, ProviderRegistry) {
    let mut registry = ProviderRegistry::new();
    for backend in backends {
        registry.register_instance(Arc::clone(backend) as Arc<dyn OcrBackend>);
    }

    let mut config = EffectiveConfig::default();
    config.provider = ProviderSelection::Auto;
    config.fallback_order = backends.iter().map(|b| b.name().to_string()).collect();
    (config, registry)
}
