//! `jobforge-core`: job domain building blocks.
//!
//! This crate contains the **pure** job model: the row, its state machine,
//! worker outcomes, retry/backoff policy and uniqueness signatures. No storage
//! or runtime concerns live here.

pub mod error;
pub mod id;
pub mod job;
pub mod outcome;
pub mod retry;
pub mod state;
pub mod unique;

pub use error::{JobError, JobResult};
pub use id::{ExecutorId, JobId};
pub use job::{AttemptError, ErrorKind, Job, NewJob, PreparedJob, DEFAULT_MAX_ATTEMPTS};
pub use outcome::Outcome;
pub use retry::{chrono_duration, BackoffStrategy, RetryPolicy, Transition};
pub use state::JobState;
pub use unique::{ReplaceField, UniqueField, UniqueOpts};
