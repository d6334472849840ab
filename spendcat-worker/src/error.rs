//! Error types for spendcat-worker

use thiserror::Error;

/// Worker error type
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Job, chunk or artifact not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No trained model for a sector (degradation, logged and absorbed by callers)
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Consolidation failed; job artifacts are preserved
    #[error("Consolidation failed: {0}")]
    Consolidation(String),

    /// Unexpected per-row classification failure
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    /// spendcat-common error
    #[error("Common error: {0}")]
    Common(#[from] spendcat_common::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            WorkerError::NotFound(_) => true,
            WorkerError::Common(e) => e.is_not_found(),
            WorkerError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure of a single classification stage
///
/// Expected degradations (no model, no dictionary hit) are not errors; this
/// only covers a model artifact that cannot be evaluated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassificationError {
    /// Model artifact is internally inconsistent
    #[error("Model error: {0}")]
    Model(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        assert!(WorkerError::NotFound("job".into()).is_not_found());
        assert!(WorkerError::Common(spendcat_common::Error::NotFound("job".into())).is_not_found());
        assert!(WorkerError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found());
        assert!(!WorkerError::Consolidation("x".into()).is_not_found());
    }

    #[test]
    fn test_classification_error_is_transparent() {
        let err: WorkerError = ClassificationError::Model("bad shape".into()).into();
        assert_eq!(err.to_string(), "Model error: bad shape");
    }
}
