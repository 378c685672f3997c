//! Job domain error model.

use thiserror::Error;

use crate::state::JobState;

/// Result type used across the job domain layer.
pub type JobResult<T> = Result<T, JobError>;

/// Domain-level job error.
///
/// Keep this focused on deterministic failures (malformed insert specs,
/// illegal state transitions). Storage concerns belong to the store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// An insert spec failed validation (e.g. empty queue, non-object args).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition not allowed by the job state machine was attempted.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted state string could not be decoded.
    #[error("invalid job state: {0}")]
    InvalidState(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn transition(from: JobState, to: JobState) -> Self {
        Self::InvalidTransition { from, to }
    }
}
