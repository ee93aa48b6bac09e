//! Service errors
//!
//! Every failure in setup or query handling ends the current operation and is
//! reported to the caller as-is. Nothing here is retried.

use thiserror::Error;

use crate::inference::model::ModelError;

/// Errors surfaced by setup and query operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("prompt is too long ({tokens} tokens, max {max})")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("failed to load model '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("failed to eval: {0}")]
    EvalFailed(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("No session configured, call setup first")]
    NotConfigured,

    #[error("A query is already in flight")]
    Busy,

    #[error("Stream delivery failed")]
    Delivery,

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl ServiceError {
    /// Wraps a model file validation failure for the given path
    pub fn from_model_error(path: &str, e: ModelError) -> Self {
        ServiceError::ModelLoadFailed {
            path: path.to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_too_long_message() {
        let e = ServiceError::PromptTooLong { tokens: 600, max: 508 };
        assert_eq!(e.to_string(), "prompt is too long (600 tokens, max 508)");
    }

    #[test]
    fn test_model_error_conversion() {
        let e = ServiceError::from_model_error("m.gguf", ModelError::FileTooSmall);
        assert!(matches!(e, ServiceError::ModelLoadFailed { ref path, .. } if path == "m.gguf"));
    }
}
