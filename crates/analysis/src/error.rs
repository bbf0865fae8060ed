use std::time::Duration;

use thiserror::Error;

/// Failure of a single pipeline stage, already classified.
///
/// The classification decides what the worker does next: transient failures
/// spend retry budget, permanent ones fail the job immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Network trouble, rate limits, upstream 5xx. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed or unsupported input. Retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The stage exceeded its execution timeout. Treated as transient.
    #[error("stage '{stage}' timed out after {after:?}")]
    TimedOut { stage: String, after: Duration },
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_) | StageError::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_count_as_transient() {
        let err = StageError::TimedOut {
            stage: "indexing".into(),
            after: Duration::from_secs(1),
        };
        assert!(err.is_transient());
        assert!(StageError::transient("503").is_transient());
        assert!(!StageError::permanent("bad pdf").is_transient());
    }
}
