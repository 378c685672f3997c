//! Job store boundary.
//!
//! The store is the single source of truth for job rows and executor
//! liveness. Every state change the engine makes goes through one of the
//! operations below, and every operation that races with other nodes is
//! expressed as a conditional write:
//!
//! - `claim` hands a row to exactly one executor (skip-locked semantics)
//! - `stage_scheduled` only promotes rows that are still `scheduled`
//! - `record_outcome` only writes if the row is still `executing` and owned
//!   by the attempt's executor
//! - `insert_unique` checks and writes under one lock per signature

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use jobforge_core::{ExecutorId, Job, JobId, JobState, ReplaceField, UniqueOpts};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Store operation error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("failed to (de)serialize job row: {0}")]
    Serialization(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of a unique insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted {
    /// A new row was written.
    Inserted(Job),
    /// A matching job already existed; it is returned (after any replacement).
    Conflict(Job),
}

impl Inserted {
    pub fn job(&self) -> &Job {
        match self {
            Inserted::Inserted(job) | Inserted::Conflict(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Inserted::Inserted(job) | Inserted::Conflict(job) => job,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Inserted::Conflict(_))
    }
}

/// Result of `JobStore::cancel`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancelled {
    /// State the row was in when the cancel took its lock.
    pub prior: JobState,
    /// The row as it is after the call.
    pub job: Job,
}

impl Cancelled {
    /// Whether this call moved the row out of `executing`.
    pub fn interrupted(&self) -> bool {
        self.prior == JobState::Executing && self.job.state == JobState::Cancelled
    }
}

/// Filter for `JobStore::list`.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub worker: Option<String>,
    pub states: Vec<JobState>,
    pub tag: Option<String>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            worker: None,
            states: Vec::new(),
            tag: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_ref().is_none_or(|q| &job.queue == q)
            && self.worker.as_ref().is_none_or(|w| &job.worker == w)
            && (self.states.is_empty() || self.states.contains(&job.state))
            && self.tag.as_ref().is_none_or(|t| job.tags.contains(t))
    }
}

/// Row counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub scheduled: u64,
    pub available: u64,
    pub executing: u64,
    pub completed: u64,
    pub discarded: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Scheduled => self.scheduled += count,
            JobState::Available => self.available += count,
            JobState::Executing => self.executing += count,
            JobState::Completed => self.completed += count,
            JobState::Discarded => self.discarded += count,
            JobState::Cancelled => self.cancelled += count,
        }
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Scheduled => self.scheduled,
            JobState::Available => self.available,
            JobState::Executing => self.executing,
            JobState::Completed => self.completed,
            JobState::Discarded => self.discarded,
            JobState::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Liveness row written by a running queue executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorHeartbeat {
    pub executor_id: ExecutorId,
    pub node: String,
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Shared job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a new row as-is.
    async fn insert(&self, job: Job) -> Result<Job, StoreError>;

    /// Write a row unless a job with the same signature conflicts under `unique`.
    ///
    /// On conflict `replace` is applied to the existing job (when it has not
    /// started yet) and the existing job is returned.
    async fn insert_unique(
        &self,
        job: Job,
        unique: &UniqueOpts,
        replace: &[ReplaceField],
        now: DateTime<Utc>,
    ) -> Result<Inserted, StoreError>;

    /// Write many rows in one batch. No uniqueness checks.
    async fn insert_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Claim up to `limit` due `available` rows of `queue` for `executor`.
    ///
    /// Rows come back ordered by priority, then `scheduled_at`, then id.
    async fn claim(
        &self,
        queue: &str,
        executor: ExecutorId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Persist the result of an attempt.
    ///
    /// Writes only if the stored row is still `executing` and attempted by
    /// `job.attempted_by`; returns whether it did.
    async fn record_outcome(&self, job: &Job) -> Result<bool, StoreError>;

    /// Cancel a non-terminal job, atomically with reading its prior state.
    /// Returns `None` if it does not exist.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Cancelled>, StoreError>;

    /// Promote up to `limit` due `scheduled` rows; returns the queue of each promoted row.
    async fn stage_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Upsert an executor liveness row.
    async fn heartbeat(&self, beat: &ExecutorHeartbeat) -> Result<(), StoreError>;

    /// Remove an executor liveness row.
    async fn deregister(&self, executor: ExecutorId) -> Result<(), StoreError>;

    /// `executing` rows whose owner has no heartbeat at or after `stale_before`.
    async fn orphaned(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Delete up to `limit` terminal rows finished before `before`.
    async fn prune(&self, before: DateTime<Utc>, limit: usize) -> Result<u64, StoreError>;

    /// Delete liveness rows last seen before `stale_before`.
    async fn prune_executors(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Row counts per state, optionally for one queue.
    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        (**self).insert(job).await
    }

    async fn insert_unique(
        &self,
        job: Job,
        unique: &UniqueOpts,
        replace: &[ReplaceField],
        now: DateTime<Utc>,
    ) -> Result<Inserted, StoreError> {
        (**self).insert_unique(job, unique, replace, now).await
    }

    async fn insert_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StoreError> {
        (**self).insert_all(jobs).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        (**self).list(filter).await
    }

    async fn claim(
        &self,
        queue: &str,
        executor: ExecutorId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).claim(queue, executor, limit, now).await
    }

    async fn record_outcome(&self, job: &Job) -> Result<bool, StoreError> {
        (**self).record_outcome(job).await
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Cancelled>, StoreError> {
        (**self).cancel(id, now).await
    }

    async fn stage_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        (**self).stage_scheduled(now, limit).await
    }

    async fn heartbeat(&self, beat: &ExecutorHeartbeat) -> Result<(), StoreError> {
        (**self).heartbeat(beat).await
    }

    async fn deregister(&self, executor: ExecutorId) -> Result<(), StoreError> {
        (**self).deregister(executor).await
    }

    async fn orphaned(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).orphaned(stale_before, limit).await
    }

    async fn prune(&self, before: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        (**self).prune(before, limit).await
    }

    async fn prune_executors(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).prune_executors(stale_before).await
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, StoreError> {
        (**self).stats(queue).await
    }
}
