use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories. None of them is fatal to the host page: every one
/// degrades to leaving videos gated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Corrupt or partial persisted consent record
    MalformedStoredState,
    /// Expected cookie banner control not found
    MissingCollaborator,
    /// Provider URL that does not have the embed shape
    UnrecognizedEmbed,
    /// Storage backend refused a write
    StorageUnavailable,
    /// Selector could not be parsed
    InvalidSelector,
    /// Configuration could not be loaded
    Config,
}

/// Structured error with context for logging
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{category:?}] {message}")]
pub struct GateError {
    pub category: ErrorCategory,
    pub message: String,
    /// Optional context (key, selector, url, ...)
    pub context: serde_json::Value,
    /// Whether retrying later could succeed
    pub recoverable: bool,
}

impl GateError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            context: serde_json::json!({}),
            recoverable: false,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }

    pub fn malformed_state(key: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::MalformedStoredState,
            format!("Malformed consent record under '{}': {}", key, reason.into()),
        )
        .with_context(serde_json::json!({ "key": key }))
    }

    pub fn missing_collaborator(selector: &str, attempts: u32) -> Self {
        Self::new(
            ErrorCategory::MissingCollaborator,
            format!("Banner control '{}' not found after {} attempts", selector, attempts),
        )
        .with_context(serde_json::json!({ "selector": selector, "attempts": attempts }))
    }

    pub fn unrecognized_embed(url: &str) -> Self {
        Self::new(ErrorCategory::UnrecognizedEmbed, format!("Unrecognized embed url: {}", url))
            .with_context(serde_json::json!({ "url": url }))
    }

    pub fn storage_unavailable(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCategory::StorageUnavailable,
            format!("Could not persist '{}': {}", key, reason),
        )
        .with_context(serde_json::json!({ "key": key }))
        .recoverable()
    }

    pub fn invalid_selector(selector: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::InvalidSelector,
            format!("Invalid selector '{}': {}", selector, reason.into()),
        )
        .with_context(serde_json::json!({ "selector": selector }))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = GateError::unrecognized_embed("https://vimeo.com/channels/staff");
        assert_eq!(
            err.to_string(),
            "[UnrecognizedEmbed] Unrecognized embed url: https://vimeo.com/channels/staff"
        );
        assert_eq!(err.context["url"], "https://vimeo.com/channels/staff");
    }

    #[test]
    fn storage_errors_are_recoverable() {
        let err = GateError::storage_unavailable("vimeo-consent", "quota exceeded");
        assert_eq!(err.category, ErrorCategory::StorageUnavailable);
        assert!(err.recoverable);
        assert!(!GateError::malformed_state("k", "eof").recoverable);
    }
}
