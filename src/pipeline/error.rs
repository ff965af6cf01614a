use std::io;

use crate::adapters::AdapterError;
use crate::store::StoreError;

/// Why a single item failed its stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Transient(AdapterError),

    #[error("{0}")]
    Permanent(AdapterError),

    #[error("Content hash mismatch: expected {expected}, found {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Staging failed: {0}")]
    Staging(#[from] io::Error),

    /// Raised by a store call made mid-stage, e.g. recording an upload.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    /// Whether the failed attempt gets a `retry_at`.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Integrity { .. } | Self::Staging(_) => true,
            Self::Permanent(_) | Self::Store(_) => false,
        }
    }
}

impl From<AdapterError> for StageError {
    fn from(error: AdapterError) -> Self {
        if error.is_transient() {
            Self::Transient(error)
        } else {
            Self::Permanent(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StageError::from(AdapterError::transient("429")).retryable());
        assert!(!StageError::from(AdapterError::permanent("404")).retryable());
        assert!(
            StageError::Integrity {
                expected: "a".into(),
                actual: "b".into()
            }
            .retryable()
        );
        assert!(StageError::from(io::Error::other("disk full")).retryable());
    }
}
