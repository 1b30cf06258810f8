//! Configuration: three layers (caller, environment, built-in defaults) merged
//! field by field into one immutable [`EffectiveConfig`].

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::ocr::{OcrOptions, OutputFormat, RecognitionOptions};

pub const ENV_PROVIDER: &str = "HAVE_OCR_PROVIDER";
pub const ENV_LANGUAGE: &str = "HAVE_OCR_LANGUAGE";
pub const ENV_CONFIDENCE_THRESHOLD: &str = "HAVE_OCR_CONFIDENCE_THRESHOLD";
pub const ENV_TIMEOUT: &str = "HAVE_OCR_TIMEOUT";

pub const DEFAULT_LANGUAGE: &str = "eng";
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.0;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Parse an optional raw value, logging and discarding anything malformed.
fn parse_opt<T: FromStr>(var: &str, raw: Option<String>) -> Option<T>
where
    T::Err: Display,
{
    let val = raw?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
            None
        }
    }
}

/// Thresholds are percentages; anything else (NaN included) is discarded.
fn checked_threshold(value: f32, source: &str) -> Option<f32> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Some(value)
    } else {
        tracing::warn!("Value {} for {} is outside 0-100. Ignoring.", value, source);
        None
    }
}

fn parse_threshold(raw: Option<String>) -> Option<f32> {
    let value: f32 = parse_opt(ENV_CONFIDENCE_THRESHOLD, raw)?;
    checked_threshold(value, ENV_CONFIDENCE_THRESHOLD)
}

fn parse_timeout(raw: Option<String>) -> Option<Duration> {
    match parse_opt::<u64>(ENV_TIMEOUT, raw)? {
        0 => {
            tracing::warn!("Value 0 for {} is not a usable timeout. Ignoring.", ENV_TIMEOUT);
            None
        }
        ms => Some(Duration::from_millis(ms)),
    }
}

/// How the orchestrator picks its first backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSelection {
    Auto,
    Named(String),
}

impl ProviderSelection {
    /// Empty input and `auto` both mean automatic selection.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            ProviderSelection::Auto
        } else {
            ProviderSelection::Named(trimmed.to_lowercase())
        }
    }
}

/// Platform the process runs on; decides the automatic priority list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeTarget {
    /// Native binaries can load the local engine.
    Native,
    /// No native libraries; hosted endpoints only.
    Wasm,
}

impl RuntimeTarget {
    pub fn current() -> Self {
        if cfg!(target_arch = "wasm32") {
            RuntimeTarget::Wasm
        } else {
            RuntimeTarget::Native
        }
    }

    pub fn priority(&self) -> Vec<String> {
        let names: &[&str] = match self {
            RuntimeTarget::Native => &["tesseract", "openai", "mistral", "deepseek"],
            RuntimeTarget::Wasm => &["openai", "mistral", "deepseek"],
        };
        names.iter().map(|s| s.to_string()).collect()
    }
}

/// One configuration source. Every field is optional so layers can be merged
/// independently per field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    pub provider: Option<ProviderSelection>,
    pub fallback_order: Option<Vec<String>>,
    pub allow_fallback: Option<bool>,
    pub language: Option<String>,
    pub min_confidence: Option<f32>,
    pub timeout: Option<Duration>,
    pub output: Option<OutputFormat>,
    pub enhance_resolution: Option<bool>,
}

impl ConfigLayer {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the environment layer from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            provider: lookup(ENV_PROVIDER).map(|v| ProviderSelection::parse(&v)),
            language: lookup(ENV_LANGUAGE),
            min_confidence: parse_threshold(lookup(ENV_CONFIDENCE_THRESHOLD)),
            timeout: parse_timeout(lookup(ENV_TIMEOUT)),
            ..Default::default()
        }
    }

    /// Built-in defaults for a runtime target. Every field is set.
    pub fn defaults(target: RuntimeTarget) -> Self {
        Self {
            provider: Some(ProviderSelection::Auto),
            fallback_order: Some(target.priority()),
            allow_fallback: Some(true),
            language: Some(DEFAULT_LANGUAGE.to_string()),
            min_confidence: Some(DEFAULT_MIN_CONFIDENCE),
            timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            output: Some(OutputFormat::Text),
            enhance_resolution: Some(false),
        }
    }

    /// Field-wise overlay: values present in `self` win over `lower`.
    pub fn over(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            provider: self.provider.or(lower.provider),
            fallback_order: self.fallback_order.or(lower.fallback_order),
            allow_fallback: self.allow_fallback.or(lower.allow_fallback),
            language: self.language.or(lower.language),
            min_confidence: self.min_confidence.or(lower.min_confidence),
            timeout: self.timeout.or(lower.timeout),
            output: self.output.or(lower.output),
            enhance_resolution: self.enhance_resolution.or(lower.enhance_resolution),
        }
    }
}

/// Merged configuration an orchestrator is built with. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub provider: ProviderSelection,
    pub fallback_order: Vec<String>,
    pub allow_fallback: bool,
    pub defaults: RecognitionOptions,
}

impl EffectiveConfig {
    /// Merge `user > env > defaults`, field by field.
    pub fn resolve(user: ConfigLayer, env: ConfigLayer, defaults: ConfigLayer) -> Self {
        let user = ConfigLayer {
            min_confidence: user
                .min_confidence
                .and_then(|value| checked_threshold(value, "min_confidence")),
            ..user
        };
        let merged = user.over(env).over(defaults);
        let fallback = ConfigLayer::defaults(RuntimeTarget::current());

        Self {
            provider: merged.provider.unwrap_or(ProviderSelection::Auto),
            fallback_order: merged
                .fallback_order
                .or(fallback.fallback_order)
                .unwrap_or_default(),
            allow_fallback: merged.allow_fallback.unwrap_or(true),
            defaults: RecognitionOptions {
                language: merged
                    .language
                    .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
                min_confidence: merged.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
                output: merged.output.unwrap_or_default(),
                timeout: merged
                    .timeout
                    .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
                enhance_resolution: merged.enhance_resolution.unwrap_or(false),
            },
        }
    }

    /// Caller layer over the process environment over built-in defaults.
    pub fn from_env_with(user: ConfigLayer) -> Self {
        Self::resolve(
            user,
            ConfigLayer::from_env(),
            ConfigLayer::defaults(RuntimeTarget::current()),
        )
    }

    /// Apply per-call overrides on top of the effective defaults.
    pub fn options_for(&self, call: &OcrOptions) -> RecognitionOptions {
        RecognitionOptions {
            language: call
                .language
                .clone()
                .unwrap_or_else(|| self.defaults.language.clone()),
            min_confidence: call
                .min_confidence
                .and_then(|value| checked_threshold(value, "min_confidence"))
                .unwrap_or(self.defaults.min_confidence),
            output: call.output.unwrap_or(self.defaults.output),
            timeout: call.timeout.unwrap_or(self.defaults.timeout),
            enhance_resolution: call
                .enhance_resolution
                .unwrap_or(self.defaults.enhance_resolution),
        }
    }

    pub fn selection_for(&self, call: &OcrOptions) -> ProviderSelection {
        match &call.provider {
            Some(name) => ProviderSelection::parse(name),
            None => self.provider.clone(),
        }
    }
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self::resolve(
            ConfigLayer::default(),
            ConfigLayer::default(),
            ConfigLayer::defaults(RuntimeTarget::current()),
        )
    }
}

/// Credentials and endpoint overrides for one hosted vision vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl VendorSettings {
    fn from_lookup<F>(lookup: &F, prefix: &str) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: String| lookup(&key).filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_empty(format!("{prefix}_API_KEY")),
            base_url: non_empty(format!("{prefix}_BASE_URL")),
            model: non_empty(format!("HAVE_OCR_{prefix}_MODEL")),
        }
    }
}

/// Settings the shipped backends are constructed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    /// Directory holding `*.traineddata`; `None` uses the engine's built-in path.
    pub tessdata_path: Option<String>,
    pub openai: VendorSettings,
    pub mistral: VendorSettings,
    pub deepseek: VendorSettings,
}

impl BackendSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            tessdata_path: lookup("TESSDATA_PREFIX").filter(|v| !v.trim().is_empty()),
            openai: VendorSettings::from_lookup(&lookup, "OPENAI"),
            mistral: VendorSettings::from_lookup(&lookup, "MISTRAL"),
            deepseek: VendorSettings::from_lookup(&lookup, "DEEPSEEK"),
        }
    }
}
