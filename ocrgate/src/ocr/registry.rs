use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::config::BackendSettings;
use crate::error::{OcrError, Result};

use super::api::{VisionBackend, VisionVendor};
use super::backend::OcrBackend;
use super::cache::HandleCache;
use super::tesseract::TesseractBackend;
use super::types::{ProbeResult, ProviderDescriptor};

type BackendFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn OcrBackend>>> + Send + Sync>;

/// Cached outcome of constructing a backend. Failures are cached too, so a
/// missing dependency is reported the same way until the registry is reset.
#[derive(Clone)]
enum BackendSlot {
    Ready(Arc<dyn OcrBackend>),
    Unavailable(String),
}

/// Known backends keyed by name, constructed lazily on first use.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: Vec<(String, BackendFactory)>,
    instances: HandleCache<String, BackendSlot>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shipped backends: tesseract and the hosted vision vendors.
    pub fn with_defaults(settings: BackendSettings) -> Self {
        let mut registry = Self::new();

        let tessdata = settings.tessdata_path.clone();
        registry.register("tesseract", move || {
            let tessdata = tessdata.clone();
            async move { Ok(Arc::new(TesseractBackend::new(tessdata)) as Arc<dyn OcrBackend>) }
        });

        for (vendor, vendor_settings) in [
            (VisionVendor::OpenAi, settings.openai),
            (VisionVendor::Mistral, settings.mistral),
            (VisionVendor::DeepSeek, settings.deepseek),
        ] {
            registry.register(vendor.name(), move || {
                let vendor_settings = vendor_settings.clone();
                async move {
                    Ok(Arc::new(VisionBackend::new(vendor, vendor_settings)) as Arc<dyn OcrBackend>)
                }
            });
        }

        registry
    }

    /// Add (or replace) a backend factory under `name`.
    pub fn register<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn OcrBackend>>> + Send + 'static,
    {
        let key = name.to_lowercase();
        let factory: BackendFactory = Arc::new(move || factory().boxed());
        match self.factories.iter_mut().find(|(n, _)| *n == key) {
            Some(entry) => entry.1 = factory,
            None => self.factories.push((key, factory)),
        }
    }

    /// Register an already-built instance.
    pub fn register_instance(&mut self, backend: Arc<dyn OcrBackend>) {
        let name = backend.name().to_string();
        self.register(&name, move || {
            let backend = Arc::clone(&backend);
            async move { Ok(backend) }
        });
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        self.factories.iter().any(|(n, _)| *n == key)
    }

    async fn slot(&self, name: &str) -> Option<BackendSlot> {
        let key = name.to_lowercase();
        let factory = self
            .factories
            .iter()
            .find(|(n, _)| *n == key)
            .map(|(_, f)| Arc::clone(f))?;

        let slot = self
            .instances
            .get_or_init(key.clone(), || async move {
                match factory().await {
                    Ok(backend) => {
                        debug!(provider = %key, "OCR backend constructed");
                        BackendSlot::Ready(backend)
                    }
                    Err(e) => {
                        let reason = format!("{key} backend unavailable: {e}");
                        warn!("{}", reason);
                        BackendSlot::Unavailable(reason)
                    }
                }
            })
            .await;
        Some(slot)
    }

    /// The backend instance for `name`, constructing it on first access.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn OcrBackend>> {
        match self.slot(name).await {
            Some(BackendSlot::Ready(backend)) => Ok(backend),
            Some(BackendSlot::Unavailable(reason)) => Err(OcrError::dependency(name, reason)),
            None => Err(OcrError::UnknownProvider(name.to_string())),
        }
    }

    /// Probe one backend. Unknown names and construction failures come back
    /// as `available: false`.
    pub async fn probe(&self, name: &str) -> ProbeResult {
        match self.slot(name).await {
            Some(BackendSlot::Ready(backend)) => backend.probe().await,
            Some(BackendSlot::Unavailable(reason)) => ProbeResult::unavailable(reason),
            None => ProbeResult::unavailable(format!("unknown provider '{name}'")),
        }
    }

    /// Probe one backend, reporting it unavailable if the check (including
    /// first-time construction) takes longer than `timeout`.
    pub async fn probe_within(&self, name: &str, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, self.probe(name)).await {
            Ok(probe) => probe,
            Err(_) => {
                warn!(
                    provider = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "OCR provider probe timed out"
                );
                ProbeResult::unavailable("probe timed out")
                    .with_detail("timeout_ms", timeout.as_millis() as u64)
            }
        }
    }

    /// Probe several backends concurrently, each bounded by `timeout`.
    /// Results keep the order of `names`.
    pub async fn probe_many(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> Vec<(String, ProbeResult)> {
        let probes = names
            .iter()
            .map(|name| async move { (name.clone(), self.probe_within(name, timeout).await) });
        join_all(probes).await
    }

    async fn describe(&self, name: &str, timeout: Duration) -> ProviderDescriptor {
        match tokio::time::timeout(timeout, self.describe_unbounded(name)).await {
            Ok(descriptor) => descriptor,
            Err(_) => {
                warn!(provider = %name, "OCR provider probe timed out");
                ProviderDescriptor {
                    name: name.to_string(),
                    probe: ProbeResult::unavailable("probe timed out")
                        .with_detail("timeout_ms", timeout.as_millis() as u64),
                    capabilities: None,
                }
            }
        }
    }

    async fn describe_unbounded(&self, name: &str) -> ProviderDescriptor {
        match self.slot(name).await {
            Some(BackendSlot::Ready(backend)) => {
                let (probe, capabilities) = futures::join!(backend.probe(), backend.capabilities());
                ProviderDescriptor {
                    name: name.to_string(),
                    probe,
                    capabilities: Some(capabilities),
                }
            }
            Some(BackendSlot::Unavailable(reason)) => ProviderDescriptor {
                name: name.to_string(),
                probe: ProbeResult::unavailable(reason),
                capabilities: None,
            },
            None => ProviderDescriptor {
                name: name.to_string(),
                probe: ProbeResult::unavailable(format!("unknown provider '{name}'")),
                capabilities: None,
            },
        }
    }

    /// Descriptors for every registered backend, probed concurrently with
    /// each probe bounded by `timeout`.
    pub async fn list(&self, timeout: Duration) -> Vec<ProviderDescriptor> {
        let names = self.names();
        join_all(names.iter().map(|name| self.describe(name, timeout))).await
    }

    /// Number of backends constructed so far (including cached failures).
    pub fn constructed(&self) -> usize {
        self.instances.len()
    }

    /// Drop all cached instances and release their resources. Safe to call
    /// repeatedly, and when nothing was ever constructed.
    pub async fn cleanup(&self) {
        let released = self.instances.clear();
        let mut count = 0;
        for (name, slot) in released {
            if let BackendSlot::Ready(backend) = slot {
                count += 1;
                if let Err(e) = backend.cleanup().await {
                    warn!(provider = %name, error = %e, "OCR backend cleanup failed");
                }
            }
        }
        if count > 0 {
            info!(count, "Released OCR backends");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VendorSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_default_registry_names() {
        let registry = ProviderRegistry::with_defaults(BackendSettings::default());
        assert_eq!(
            registry.names(),
            vec!["tesseract", "openai", "mistral", "deepseek"]
        );
        assert!(registry.is_registered("OpenAI"));
        assert!(!registry.is_registered("onnx"));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve("nope").await,
            Err(OcrError::UnknownProvider(_))
        ));
        let probe = registry.probe("nope").await;
        assert!(!probe.available);
    }

    #[tokio::test]
    async fn test_construction_failure_is_unavailable_and_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let mut registry = ProviderRegistry::new();
        registry.register("broken", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(OcrError::dependency("broken", "runtime missing")) }
        });

        let err = registry.resolve("broken").await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);
        let probe = registry.probe("broken").await;
        assert!(!probe.available);
        assert!(probe.reason.unwrap().contains("runtime missing"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        registry.cleanup().await;
        let _ = registry.resolve("broken").await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolve_caches_instance() {
        let registry = ProviderRegistry::with_defaults(BackendSettings {
            openai: VendorSettings {
                api_key: Some("k".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let first = registry.resolve("openai").await.unwrap();
        let second = registry.resolve("openai").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.constructed(), 1);
    }

    #[tokio::test]
    async fn test_list_reports_every_backend() {
        let registry = ProviderRegistry::with_defaults(BackendSettings::default());
        let descriptors = registry.list(Duration::from_secs(5)).await;
        assert_eq!(descriptors.len(), 4);

        let openai = descriptors.iter().find(|d| d.name == "openai").unwrap();
        assert!(!openai.probe.available);
        let caps = openai.capabilities.as_ref().unwrap();
        assert!(!caps.bounding_boxes);
        assert!(!caps.native_confidence);
    }

    struct StalledProbe;

    #[async_trait::async_trait]
    impl OcrBackend for StalledProbe {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn recognize(
            &self,
            _images: &[crate::ocr::types::NormalizedImage],
            _options: &crate::ocr::types::RecognitionOptions,
        ) -> Result<crate::ocr::types::Recognition> {
            Err(OcrError::processing("stalled", "not used"))
        }

        async fn probe(&self) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ProbeResult::available()
        }

        async fn capabilities(&self) -> crate::ocr::types::CapabilitySummary {
            crate::ocr::types::CapabilitySummary {
                languages: Vec::new(),
                formats: Vec::new(),
                max_image_bytes: None,
                bounding_boxes: false,
                native_confidence: false,
            }
        }

        fn supported_languages(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_stalled_probe_is_bounded() {
        let mut registry = ProviderRegistry::new();
        registry.register_instance(Arc::new(StalledProbe));

        let started = std::time::Instant::now();
        let probes = registry
            .probe_many(&["stalled".to_string()], Duration::from_millis(50))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!probes[0].1.available);
        assert_eq!(probes[0].1.reason.as_deref(), Some("probe timed out"));

        let listed = registry.list(Duration::from_millis(50)).await;
        assert!(!listed[0].probe.available);
        assert!(listed[0].capabilities.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_twice() {
        let registry = ProviderRegistry::with_defaults(BackendSettings::default());
        registry.cleanup().await;
        let _ = registry.resolve("mistral").await;
        registry.cleanup().await;
        registry.cleanup().await;
        assert_eq!(registry.constructed(), 0);
    }
}
