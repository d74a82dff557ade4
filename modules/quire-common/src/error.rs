use thiserror::Error;

use crate::types::IssueStatus;

pub type Result<T> = std::result::Result<T, QuireError>;

#[derive(Error, Debug)]
pub enum QuireError {
    /// External service timeout, 5xx, or other condition worth another attempt.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Missing prerequisites for a stage (no modules, no candidates, ...).
    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid issue transition: {from} -> {to}")]
    InvalidTransition { from: IssueStatus, to: IssueStatus },

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl QuireError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether another attempt of the same step could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Store(_) | Self::Anyhow(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_store_errors_are_retryable() {
        assert!(QuireError::Transient("timeout".into()).is_retryable());
        assert!(QuireError::Store("connection reset".into()).is_retryable());
        assert!(QuireError::from(anyhow::anyhow!("boom")).is_retryable());
    }

    #[test]
    fn configuration_class_errors_are_not_retryable() {
        assert!(!QuireError::Fatal("no active modules".into()).is_retryable());
        assert!(!QuireError::Config("bad weight".into()).is_retryable());
        assert!(!QuireError::not_found("issue", "abc").is_retryable());
        assert!(!QuireError::InvalidTransition {
            from: IssueStatus::Sent,
            to: IssueStatus::Processing,
        }
        .is_retryable());
    }

    #[test]
    fn not_found_message_names_entity() {
        let err = QuireError::not_found("module", "spotlight");
        assert_eq!(err.to_string(), "module not found: spotlight");
    }
}
