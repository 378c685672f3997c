//! What a worker reports back after performing a job.

use std::time::Duration;

/// Result of one job attempt, as returned by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job finished; it becomes `completed`.
    Success,
    /// The attempt failed; retried with backoff until attempts run out.
    Error(String),
    /// Run again after the delay without consuming an attempt.
    Snooze(Duration),
    /// Stop for good as `cancelled`, regardless of remaining attempts.
    Cancel(String),
    /// Stop for good as `discarded`, regardless of remaining attempts.
    Discard(String),
}

impl Outcome {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(reason.into())
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancel(reason.into())
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        Self::Discard(reason.into())
    }

    pub fn snooze_secs(secs: u64) -> Self {
        Self::Snooze(Duration::from_secs(secs))
    }

    /// Short label used for logs and telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error(_) => "error",
            Outcome::Snooze(_) => "snooze",
            Outcome::Cancel(_) => "cancel",
            Outcome::Discard(_) => "discard",
        }
    }
}

impl<E: core::fmt::Display> From<Result<(), E>> for Outcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Error(e.to_string()),
        }
    }
}
