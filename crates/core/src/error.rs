//! Job engine error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the job engine's public surface.
pub type JobResult<T> = Result<T, JobError>;

/// Errors surfaced synchronously to callers of the job service.
///
/// Handler failures are deliberately absent: they are absorbed into a
/// persisted `failed` record and never returned to a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Unknown kind, malformed payload or bad filter input. Nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No record exists for the given id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The operation is not allowed in the record's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistence I/O failure.
    #[error("store error: {0}")]
    Store(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Stable machine-readable code for the external API layer.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation_error",
            JobError::NotFound(_) => "not_found",
            JobError::Conflict(_) => "conflict",
            JobError::Store(_) => "store_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(JobError::validation("x").code(), "validation_error");
        assert_eq!(JobError::NotFound(JobId::new()).code(), "not_found");
        assert_eq!(JobError::conflict("x").code(), "conflict");
        assert_eq!(JobError::store("x").code(), "store_error");
    }

    #[test]
    fn display_includes_context() {
        let id = JobId::new();
        assert_eq!(JobError::NotFound(id).to_string(), format!("job not found: {id}"));
        assert_eq!(
            JobError::validation("unknown job kind: nope").to_string(),
            "validation failed: unknown job kind: nope"
        );
    }
}
