use thiserror::Error;

use crate::types::job::JobId;

/// Reasons a submission is refused before it reaches the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ValidationError {
    #[error("priority must be between 1 and 10")]
    Priority,
    #[error("max retries must be between 0 and 5")]
    MaxRetries,
    #[error("unknown target")]
    Target,
    #[error("field must not be empty")]
    EmptyField,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The shared store could not be reached or rejected a command. Loops
    /// treat this as transient.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    DuplicateId(JobId),

    #[error("malformed record for {id}: {reason}")]
    MalformedRecord { id: String, reason: String },

    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("payload serialisation error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl DispatchError {
    pub(crate) fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
