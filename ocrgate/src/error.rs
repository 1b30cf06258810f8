use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Failure classes the orchestrator uses to decide between advancing to the
/// next backend and surfacing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend cannot be used at all (missing credential, missing runtime).
    Dependency,
    /// Backend attempted the call and failed (timeout, bad output, network).
    Processing,
    /// Backend deliberately declines a requested feature.
    Unsupported,
    /// Caller or configuration mistake that no backend can fix.
    Invalid,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Dependency => "dependency",
            ErrorKind::Processing => "processing",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR provider '{provider}' unavailable: {message}")]
    Dependency {
        provider: String,
        message: String,
        details: Option<Value>,
    },

    #[error("OCR provider '{provider}' failed: {message}")]
    Processing {
        provider: String,
        message: String,
        details: Option<Value>,
    },

    #[error("OCR provider '{provider}' does not support {message}")]
    Unsupported {
        provider: String,
        message: String,
        details: Option<Value>,
    },

    #[error("no valid images to process ({} skipped)", skipped.len())]
    NoUsableInput { skipped: Vec<String> },

    #[error("Unknown OCR provider: {0}")]
    UnknownProvider(String),

    #[error("No OCR providers configured")]
    NoProviders,

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcrError {
    pub fn dependency(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            provider: provider.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn processing(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            provider: provider.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn unsupported(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach a diagnostic payload. No-op for variants without one.
    pub fn with_details(mut self, value: Value) -> Self {
        match &mut self {
            OcrError::Dependency { details, .. }
            | OcrError::Processing { details, .. }
            | OcrError::Unsupported { details, .. } => *details = Some(value),
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::Dependency { .. } | OcrError::NoProviders => ErrorKind::Dependency,
            OcrError::Processing { .. }
            | OcrError::NoUsableInput { .. }
            | OcrError::Http(_)
            | OcrError::Json(_)
            | OcrError::Io(_) => ErrorKind::Processing,
            OcrError::Unsupported { .. } => ErrorKind::Unsupported,
            OcrError::UnknownProvider(_) => ErrorKind::Invalid,
        }
    }

    /// Name of the backend the failure originated from, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            OcrError::Dependency { provider, .. }
            | OcrError::Processing { provider, .. }
            | OcrError::Unsupported { provider, .. } => Some(provider),
            OcrError::UnknownProvider(name) => Some(name),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            OcrError::Dependency { details, .. }
            | OcrError::Processing { details, .. }
            | OcrError::Unsupported { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    /// Re-tag an unclassified error as a processing failure of `provider`.
    pub(crate) fn attributed_to(self, provider: &str) -> Self {
        match self {
            OcrError::Http(e) => OcrError::processing(provider, e.to_string()),
            OcrError::Json(e) => OcrError::processing(provider, format!("malformed output: {e}")),
            OcrError::Io(e) => OcrError::processing(provider, e.to_string()),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, OcrError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            OcrError::dependency("tesseract", "missing").kind(),
            ErrorKind::Dependency
        );
        assert_eq!(
            OcrError::processing("openai", "timeout").kind(),
            ErrorKind::Processing
        );
        assert_eq!(
            OcrError::unsupported("tesseract", "language 'xyz'").kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            OcrError::NoUsableInput { skipped: vec![] }.kind(),
            ErrorKind::Processing
        );
        assert_eq!(
            OcrError::UnknownProvider("nope".into()).kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn test_details_attached_and_provider_reported() {
        let err =
            OcrError::processing("mistral", "bad gateway").with_details(json!({"status": 502}));
        assert_eq!(err.provider(), Some("mistral"));
        assert_eq!(err.details(), Some(&json!({"status": 502})));
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn test_no_usable_input_message() {
        let err = OcrError::NoUsableInput {
            skipped: vec!["image 0: too small".into()],
        };
        assert!(err.to_string().contains("no valid images to process"));
    }

    #[test]
    fn test_attributed_to_keeps_classified_errors() {
        let err = OcrError::unsupported("a", "x").attributed_to("b");
        assert_eq!(err.provider(), Some("a"));

        let io = OcrError::Io(std::io::Error::other("boom")).attributed_to("b");
        assert_eq!(io.provider(), Some("b"));
        assert_eq!(io.kind(), ErrorKind::Processing);
    }
}
