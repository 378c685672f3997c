//! The job row and its insert spec.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{JobError, JobResult};
use crate::id::{ExecutorId, JobId};
use crate::outcome::Outcome;
use crate::retry::{chrono_duration, RetryPolicy, Transition};
use crate::state::JobState;
use crate::unique::{ReplaceField, UniqueOpts};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_PRIORITY: i16 = 0;
pub const MAX_PRIORITY: i16 = 9;
const MAX_NAME_LEN: usize = 128;

/// Why an attempt ended up in the error list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The worker returned an error (or panicked).
    Error,
    /// The worker ran past its timeout.
    Timeout,
    /// The owning executor died mid-attempt.
    Orphaned,
    /// The worker cancelled the job.
    Cancelled,
    /// The worker discarded the job.
    Discarded,
}

/// Record of one failed or aborted attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub error: String,
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Name the worker registry resolves to a capability.
    pub worker: String,
    /// JSON object handed to the worker.
    pub args: JsonValue,
    pub state: JobState,
    /// Lower runs first.
    pub priority: i16,
    /// Attempts started so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    /// Executor that claimed the current (or last) attempt.
    pub attempted_by: Option<ExecutorId>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Append-only attempt error history.
    pub errors: Vec<AttemptError>,
    pub unique_key: Option<String>,
    pub tags: Vec<String>,
    pub meta: JsonValue,
}

impl Job {
    /// Deserialize the args into a typed payload.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// The single terminal timestamp, once the job has finished.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.discarded_at).or(self.cancelled_at)
    }

    fn transition(&mut self, next: JobState) -> JobResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::transition(self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Promote a due scheduled job.
    pub fn stage(&mut self) -> JobResult<()> {
        self.transition(JobState::Available)
    }

    /// Mark job as claimed by `executor`.
    pub fn claim(&mut self, executor: ExecutorId, now: DateTime<Utc>) -> JobResult<()> {
        if self.attempt >= self.max_attempts {
            return Err(JobError::validation(format!(
                "job {} has no attempts left ({}/{})",
                self.id, self.attempt, self.max_attempts
            )));
        }
        self.transition(JobState::Executing)?;
        self.attempt += 1;
        self.attempted_at = Some(now);
        self.attempted_by = Some(executor);
        Ok(())
    }

    /// Apply a worker outcome to an executing job.
    ///
    /// `backoff` overrides the policy delay for error retries.
    pub fn apply_outcome(
        &mut self,
        outcome: &Outcome,
        policy: &RetryPolicy,
        backoff: Option<Duration>,
        now: DateTime<Utc>,
    ) -> JobResult<Transition> {
        match outcome {
            Outcome::Error(reason) => self.apply_failure(ErrorKind::Error, reason, policy, backoff, now),
            _ => {
                let transition = policy.resolve(self, outcome, backoff, now);
                match outcome {
                    Outcome::Cancel(reason) if !reason.is_empty() => {
                        self.commit(transition, now)?;
                        self.push_error(ErrorKind::Cancelled, reason, now);
                    }
                    Outcome::Discard(reason) if !reason.is_empty() => {
                        self.commit(transition, now)?;
                        self.push_error(ErrorKind::Discarded, reason, now);
                    }
                    _ => self.commit(transition, now)?,
                }
                Ok(transition)
            }
        }
    }

    /// Record a failed attempt and retry or discard it.
    pub fn apply_failure(
        &mut self,
        kind: ErrorKind,
        reason: &str,
        policy: &RetryPolicy,
        backoff: Option<Duration>,
        now: DateTime<Utc>,
    ) -> JobResult<Transition> {
        let transition = policy.resolve_failure(self, backoff, now);
        self.commit(transition, now)?;
        self.push_error(kind, reason, now);
        Ok(transition)
    }

    fn commit(&mut self, transition: Transition, now: DateTime<Utc>) -> JobResult<()> {
        if self.state != JobState::Executing {
            let to = match transition {
                Transition::Complete => JobState::Completed,
                Transition::Discard => JobState::Discarded,
                Transition::Cancel => JobState::Cancelled,
                Transition::Retry { .. } | Transition::Snooze { .. } => JobState::Available,
            };
            return Err(JobError::transition(self.state, to));
        }

        match transition {
            Transition::Complete => {
                self.state = JobState::Completed;
                self.completed_at = Some(now);
            }
            Transition::Discard => {
                self.state = JobState::Discarded;
                self.discarded_at = Some(now);
            }
            Transition::Cancel => {
                self.state = JobState::Cancelled;
                self.cancelled_at = Some(now);
            }
            Transition::Retry { at } => {
                self.state = JobState::Available;
                self.scheduled_at = at;
            }
            Transition::Snooze { at } => {
                self.state = JobState::Available;
                self.scheduled_at = at;
                // A snoozed attempt is handed back.
                self.attempt = self.attempt.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn push_error(&mut self, kind: ErrorKind, reason: &str, now: DateTime<Utc>) {
        self.errors.push(AttemptError {
            attempt: self.attempt,
            at: now,
            kind,
            error: reason.to_string(),
        });
    }

    /// Cancel a job from outside its worker. Terminal jobs are left untouched.
    ///
    /// Returns whether the job changed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Cancelled;
        self.cancelled_at = Some(now);
        true
    }

    /// Overwrite `fields` on this (existing) job with values from `incoming`.
    ///
    /// Only jobs that have not started yet are touched; returns whether anything was replaced.
    pub fn replace_from(&mut self, incoming: &Job, fields: &[ReplaceField], now: DateTime<Utc>) -> bool {
        if fields.is_empty() || !matches!(self.state, JobState::Scheduled | JobState::Available) {
            return false;
        }

        for field in fields {
            match field {
                ReplaceField::Args => self.args = incoming.args.clone(),
                // A pending row always keeps one claimable attempt.
                ReplaceField::MaxAttempts => {
                    self.max_attempts = incoming.max_attempts.max(self.attempt + 1);
                }
                ReplaceField::Meta => self.meta = incoming.meta.clone(),
                ReplaceField::Priority => self.priority = incoming.priority,
                // An available row stays available; claims still wait for `scheduled_at`.
                ReplaceField::ScheduledAt => {
                    self.scheduled_at = incoming.scheduled_at;
                    if self.state == JobState::Scheduled && incoming.scheduled_at <= now {
                        let _ = self.stage();
                    }
                }
                ReplaceField::Tags => self.tags = incoming.tags.clone(),
            }
        }
        true
    }
}

/// Insert spec for a new job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub worker: String,
    pub args: JsonValue,
    pub priority: i16,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub schedule_in: Option<Duration>,
    pub unique: Option<UniqueOpts>,
    pub replace: Vec<ReplaceField>,
    pub tags: Vec<String>,
    pub meta: JsonValue,
}

/// A validated insert: the row to write plus its conflict handling.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub job: Job,
    pub unique: Option<UniqueOpts>,
    pub replace: Vec<ReplaceField>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, worker: impl Into<String>, args: JsonValue) -> Self {
        Self {
            queue: queue.into(),
            worker: worker.into(),
            args,
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
            schedule_in: None,
            unique: None,
            replace: Vec::new(),
            tags: Vec::new(),
            meta: JsonValue::Object(Default::default()),
        }
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Run no earlier than `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self.schedule_in = None;
        self
    }

    /// Run no earlier than `delay` after insert.
    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.schedule_in = Some(delay);
        self.scheduled_at = None;
        self
    }

    pub fn unique(mut self, opts: UniqueOpts) -> Self {
        self.unique = Some(opts);
        self
    }

    pub fn replace(mut self, fields: impl IntoIterator<Item = ReplaceField>) -> Self {
        self.replace = fields.into_iter().collect();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn meta(mut self, meta: JsonValue) -> Self {
        self.meta = meta;
        self
    }

    pub fn validate(&self) -> JobResult<()> {
        validate_name("queue", &self.queue)?;
        validate_name("worker", &self.worker)?;

        if !self.args.is_object() {
            return Err(JobError::validation("args must be a JSON object"));
        }
        if !self.meta.is_object() {
            return Err(JobError::validation("meta must be a JSON object"));
        }
        if !(DEFAULT_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(JobError::validation(format!(
                "priority must be between {DEFAULT_PRIORITY} and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.max_attempts == 0 {
            return Err(JobError::validation("max_attempts must be at least 1"));
        }
        if let Some(unique) = &self.unique {
            unique.validate()?;
        }
        if !self.replace.is_empty() && self.unique.is_none() {
            return Err(JobError::validation("replace requires unique options"));
        }
        Ok(())
    }

    /// Validate and turn the spec into a fresh row.
    pub fn build(self, now: DateTime<Utc>) -> JobResult<PreparedJob> {
        self.validate()?;

        let scheduled_at = match (self.scheduled_at, self.schedule_in) {
            (Some(at), _) => at,
            (None, Some(delay)) => now + chrono_duration(delay),
            (None, None) => now,
        };
        let state = if scheduled_at > now {
            JobState::Scheduled
        } else {
            JobState::Available
        };
        let unique_key = self
            .unique
            .as_ref()
            .map(|u| u.signature(&self.queue, &self.worker, &self.args));

        let job = Job {
            id: JobId::new(),
            queue: self.queue,
            worker: self.worker,
            args: self.args,
            state,
            priority: self.priority,
            attempt: 0,
            max_attempts: self.max_attempts,
            scheduled_at,
            inserted_at: now,
            attempted_at: None,
            attempted_by: None,
            completed_at: None,
            discarded_at: None,
            cancelled_at: None,
            errors: Vec::new(),
            unique_key,
            tags: normalize_tags(self.tags),
            meta: self.meta,
        };

        Ok(PreparedJob {
            job,
            unique: self.unique,
            replace: self.replace,
        })
    }
}

fn validate_name(what: &str, value: &str) -> JobResult<()> {
    if value.is_empty() {
        return Err(JobError::validation(format!("{what} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(JobError::validation(format!(
            "{what} must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(JobError::validation(format!(
            "{what} must not contain whitespace: {value:?}"
        )));
    }
    Ok(())
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}
