use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{BackendSettings, ConfigLayer, EffectiveConfig, ProviderSelection};
use crate::error::{ErrorKind, OcrError, Result};

use super::confidence::aggregate;
use super::normalize::{normalize_batch, NormalizedBatch};
use super::registry::ProviderRegistry;
use super::types::{
    AttemptFailure, ImageInput, NormalizedImage, OcrMetadata, OcrOptions, OcrResult, OutputFormat,
    ProbeResult, ProviderDescriptor, Recognition, RecognitionOptions,
};

/// Ordered candidates for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CandidatePlan {
    names: Vec<String>,
    pinned: Option<String>,
    allow_fallback: bool,
}

/// Where a call stands after each step.
#[derive(Debug)]
enum AttemptState {
    Selecting { next: usize },
    Invoking { index: usize },
    Failed { index: usize, error: OcrError },
    Succeeded { index: usize, recognition: Recognition },
    Exhausted,
}

/// Entry point: picks a backend, runs it, falls back on failure and shapes
/// the output into one [`OcrResult`].
pub struct OcrOrchestrator {
    config: EffectiveConfig,
    registry: ProviderRegistry,
}

impl OcrOrchestrator {
    pub fn new(config: EffectiveConfig, registry: ProviderRegistry) -> Self {
        Self { config, registry }
    }

    /// Orchestrator over the shipped backends, configured from the process
    /// environment with `user` layered on top.
    pub fn from_env(user: ConfigLayer) -> Self {
        Self::new(
            EffectiveConfig::from_env_with(user),
            ProviderRegistry::with_defaults(BackendSettings::from_env()),
        )
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Every registered backend with its probe result, probed concurrently
    /// within the default timeout.
    pub async fn list_providers(&self) -> Vec<ProviderDescriptor> {
        self.registry.list(self.config.defaults.timeout).await
    }

    /// Release every cached backend resource. Idempotent.
    pub async fn cleanup(&self) {
        self.registry.cleanup().await;
    }

    fn plan(&self, options: &OcrOptions) -> Result<CandidatePlan> {
        let allow_fallback = options.allow_fallback.unwrap_or(self.config.allow_fallback);

        let mut names: Vec<String> = Vec::new();
        let pinned = match self.config.selection_for(options) {
            ProviderSelection::Named(name) => {
                let name = name.to_lowercase();
                if !self.registry.is_registered(&name) {
                    return Err(OcrError::UnknownProvider(name));
                }
                names.push(name.clone());
                Some(name)
            }
            ProviderSelection::Auto => None,
        };

        if pinned.is_none() || allow_fallback {
            for name in &self.config.fallback_order {
                let name = name.to_lowercase();
                if names.contains(&name) {
                    continue;
                }
                if !self.registry.is_registered(&name) {
                    debug!(provider = %name, "Skipping unregistered provider in fallback order");
                    continue;
                }
                names.push(name);
            }
        }

        if names.is_empty() {
            return Err(OcrError::NoProviders);
        }

        Ok(CandidatePlan {
            names,
            pinned,
            allow_fallback,
        })
    }

    /// Run OCR over `images`. Images are normalized once; candidates are
    /// probed once, then tried strictly in order.
    pub async fn perform_ocr(
        &self,
        images: &[ImageInput],
        options: &OcrOptions,
    ) -> Result<OcrResult> {
        let span = info_span!("ocr", call_id = %Uuid::new_v4(), images = images.len());
        self.perform_ocr_inner(images, options).instrument(span).await
    }

    async fn perform_ocr_inner(
        &self,
        images: &[ImageInput],
        options: &OcrOptions,
    ) -> Result<OcrResult> {
        let started = Instant::now();
        let batch = normalize_batch(images)?;
        let recognition_options = self.config.options_for(options);
        let plan = self.plan(options)?;

        let probes = self
            .registry
            .probe_many(&plan.names, recognition_options.timeout)
            .await;

        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut last_error: Option<OcrError> = None;
        let mut last_unavailable: Option<(String, ProbeResult)> = None;
        let mut state = AttemptState::Selecting { next: 0 };

        loop {
            state = match state {
                AttemptState::Selecting { next } => match probes.get(next) {
                    None => AttemptState::Exhausted,
                    Some((_, probe)) if probe.available => AttemptState::Invoking { index: next },
                    Some((name, probe)) => {
                        let reason = probe
                            .reason
                            .clone()
                            .unwrap_or_else(|| "unavailable".to_string());
                        if plan.pinned.as_deref() == Some(name.as_str()) {
                            let error = OcrError::dependency(name, reason)
                                .with_details(serde_json::Value::Object(probe.details.clone()));
                            AttemptState::Failed { index: next, error }
                        } else {
                            debug!(
                                provider = %name,
                                reason = %reason,
                                "Provider unavailable, skipping"
                            );
                            last_unavailable = Some((name.clone(), probe.clone()));
                            AttemptState::Selecting { next: next + 1 }
                        }
                    }
                },
                AttemptState::Invoking { index } => {
                    let name = &probes[index].0;
                    match self.attempt(name, &batch.images, &recognition_options).await {
                        Ok(recognition) => AttemptState::Succeeded { index, recognition },
                        Err(error) => AttemptState::Failed { index, error },
                    }
                }
                AttemptState::Failed { index, error } => {
                    let name = &probes[index].0;
                    warn!(
                        provider = %name,
                        kind = %error.kind(),
                        error = %error,
                        "OCR provider failed"
                    );
                    failures.push(AttemptFailure {
                        provider: name.clone(),
                        kind: error.kind(),
                        message: error.to_string(),
                    });

                    let pinned_here = plan.pinned.as_deref() == Some(name.as_str());
                    let terminal = error.kind() == ErrorKind::Unsupported
                        && pinned_here
                        && !plan.allow_fallback;
                    if terminal {
                        return Err(error);
                    }

                    last_error = Some(error);
                    AttemptState::Selecting { next: index + 1 }
                }
                AttemptState::Succeeded { index, recognition } => {
                    let name = probes[index].0.clone();
                    let result = shape_result(
                        name,
                        recognition,
                        &recognition_options,
                        &batch,
                        failures,
                        started,
                    );
                    info!(
                        provider = %result.metadata.provider,
                        fallback_from = ?result.metadata.fallback_from,
                        confidence = result.confidence,
                        elapsed_ms = result.metadata.processing_time_ms,
                        "OCR completed"
                    );
                    return Ok(result);
                }
                AttemptState::Exhausted => {
                    return Err(match (last_error, last_unavailable) {
                        (Some(error), _) => error,
                        (None, Some((name, probe))) => OcrError::dependency(
                            &name,
                            probe.reason.unwrap_or_else(|| "unavailable".to_string()),
                        )
                        .with_details(serde_json::Value::Object(probe.details)),
                        (None, None) => OcrError::NoProviders,
                    });
                }
            };
        }
    }

    async fn attempt(
        &self,
        name: &str,
        images: &[NormalizedImage],
        options: &RecognitionOptions,
    ) -> Result<Recognition> {
        let backend = self.registry.resolve(name).await?;

        let supported = backend.supported_languages();
        if !supported.is_empty() {
            if let Some(missing) = options
                .languages()
                .into_iter()
                .find(|code| !supported.iter().any(|s| s == code))
            {
                return Err(OcrError::unsupported(name, format!("language '{missing}'")));
            }
        }

        debug!(provider = %name, images = images.len(), "Invoking OCR provider");
        match tokio::time::timeout(options.timeout, backend.recognize(images, options)).await {
            Ok(result) => result.map_err(|e| e.attributed_to(name)),
            Err(_) => Err(OcrError::processing(
                name,
                format!("OCR operation timed out after {} ms", options.timeout.as_millis()),
            )),
        }
    }
}

fn shape_result(
    provider: String,
    recognition: Recognition,
    options: &RecognitionOptions,
    batch: &NormalizedBatch,
    failures: Vec<AttemptFailure>,
    started: Instant,
) -> OcrResult {
    let aggregated = aggregate(
        recognition.detections,
        options.min_confidence,
        recognition.estimated_confidence,
    );

    let detections = match options.output {
        OutputFormat::Text => Vec::new(),
        OutputFormat::Structured => aggregated.retained,
    };

    OcrResult {
        text: recognition.text,
        confidence: aggregated.overall,
        detections,
        metadata: OcrMetadata {
            provider,
            processing_time_ms: started.elapsed().as_millis() as u64,
            language: options.language.clone(),
            fallback_from: failures.first().map(|f| f.provider.clone()),
            failures,
            skipped_images: batch.skipped.iter().map(|s| s.index).collect(),
            confidence_estimated: aggregated.estimated,
        },
    }
}

type OrchestratorBuilder = Box<dyn Fn() -> OcrOrchestrator + Send + Sync>;

/// Caller-owned holder for one lazily built orchestrator. `reset` tears the
/// instance down; the next `get` builds a fresh one.
pub struct OrchestratorHandle {
    builder: OrchestratorBuilder,
    current: Mutex<Option<Arc<OcrOrchestrator>>>,
}

impl OrchestratorHandle {
    pub fn new<F>(builder: F) -> Self
    where
        F: Fn() -> OcrOrchestrator + Send + Sync + 'static,
    {
        Self {
            builder: Box::new(builder),
            current: Mutex::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self::new(|| OcrOrchestrator::from_env(ConfigLayer::default()))
    }

    pub async fn get(&self) -> Arc<OcrOrchestrator> {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(orchestrator) => Arc::clone(orchestrator),
            None => {
                let orchestrator = Arc::new((self.builder)());
                *current = Some(Arc::clone(&orchestrator));
                orchestrator
            }
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Clean up and drop the current instance, if any.
    pub async fn reset(&self) {
        let taken = self.current.lock().await.take();
        if let Some(orchestrator) = taken {
            orchestrator.cleanup().await;
        }
    }
}
