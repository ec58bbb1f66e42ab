//! Caller-facing error taxonomy.
//!
//! Provider failures are consumed by the retry policy and only reach callers
//! through the `error_message` recorded on the job; everything a caller can
//! receive directly is one of these variants.
use thiserror::Error;

use crate::generation::GenerationError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or incomplete submission. Never retried.
    #[error("invalid argument: {0}")]
    Validation(String),
    /// State-machine guard violation; the caller should re-fetch state.
    #[error("failed precondition: {0}")]
    Precondition(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient provider error: {0}")]
    TransientProvider(String),
    #[error("permanent provider error: {0}")]
    PermanentProvider(String),
    /// Job abandoned by its worker and failed by the janitor.
    #[error("stale job: {0}")]
    StaleJob(String),
    #[error("job cancelled")]
    Cancelled,
    /// Transport failure seen by a client while polling or streaming.
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Stable status code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_argument",
            Self::Precondition(_) => "failed_precondition",
            Self::NotFound(_) => "not_found",
            Self::TransientProvider(_) | Self::Network(_) => "unavailable",
            Self::PermanentProvider(_) => "aborted",
            Self::StaleJob(_) => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Store(_) => "internal",
        }
    }

    /// Whether a client may retry the same call without changing its input.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::TransientProvider(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.into())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.into())
    }
}

impl From<GenerationError> for PipelineError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Transient(msg) => Self::TransientProvider(msg),
            GenerationError::Permanent(msg) => Self::PermanentProvider(msg),
            GenerationError::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(PipelineError::validation("x").code(), "invalid_argument");
        assert_eq!(PipelineError::precondition("x").code(), "failed_precondition");
        assert_eq!(PipelineError::Network("down".into()).code(), "unavailable");
        assert_eq!(
            PipelineError::Store(anyhow::anyhow!("disk")).code(),
            "internal"
        );
    }

    #[test]
    fn generation_errors_map_by_kind() {
        let err: PipelineError = GenerationError::Transient("429".into()).into();
        assert!(matches!(err, PipelineError::TransientProvider(_)));
        assert!(err.is_recoverable());

        let err: PipelineError = GenerationError::Permanent("policy".into()).into();
        assert!(matches!(err, PipelineError::PermanentProvider(_)));
        assert!(!err.is_recoverable());
    }
}
