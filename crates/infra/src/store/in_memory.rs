//! In-memory job store for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{ExecutorId, Job, JobId, JobState, ReplaceField, UniqueOpts};

use super::{Cancelled, ExecutorHeartbeat, Inserted, JobFilter, JobStats, JobStore, StoreError};

/// In-memory job store.
///
/// Every mutating operation takes the single write lock, which gives the same
/// exclusivity a row lock gives the Postgres store: a claimed row can never be
/// handed to two executors.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    executors: RwLock<HashMap<ExecutorId, ExecutorHeartbeat>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a row unconditionally. Test helper for building fixtures
    /// (backdated timestamps, rows owned by dead executors).
    pub fn put(&self, job: Job) -> Result<(), StoreError> {
        self.write_jobs()?.insert(job.id, job);
        Ok(())
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs.read().map_err(|_| StoreError::Poisoned)
    }

    fn write_jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs.write().map_err(|_| StoreError::Poisoned)
    }

    fn executors(&self) -> Result<RwLockWriteGuard<'_, HashMap<ExecutorId, ExecutorHeartbeat>>, StoreError> {
        self.executors.write().map_err(|_| StoreError::Poisoned)
    }
}

fn insert_row(jobs: &mut HashMap<JobId, Job>, job: Job) -> Result<Job, StoreError> {
    if jobs.contains_key(&job.id) {
        return Err(StoreError::Conflict(format!("job already exists: {}", job.id)));
    }
    jobs.insert(job.id, job.clone());
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.write_jobs()?;
        insert_row(&mut jobs, job)
    }

    async fn insert_unique(
        &self,
        mut job: Job,
        unique: &UniqueOpts,
        replace: &[ReplaceField],
        now: DateTime<Utc>,
    ) -> Result<Inserted, StoreError> {
        let key = job
            .unique_key
            .clone()
            .unwrap_or_else(|| unique.signature(&job.queue, &job.worker, &job.args));
        job.unique_key = Some(key.clone());
        let window_start = unique.window_start(now);

        let mut jobs = self.write_jobs()?;

        let existing = jobs.values_mut().find(|j| {
            j.unique_key.as_deref() == Some(key.as_str())
                && unique.states.contains(&j.state)
                && window_start.is_none_or(|start| j.inserted_at >= start)
        });

        if let Some(existing) = existing {
            existing.replace_from(&job, replace, now);
            return Ok(Inserted::Conflict(existing.clone()));
        }

        insert_row(&mut jobs, job).map(Inserted::Inserted)
    }

    async fn insert_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StoreError> {
        let mut stored = self.write_jobs()?;

        let mut seen = HashSet::with_capacity(jobs.len());
        for job in &jobs {
            if stored.contains_key(&job.id) || !seen.insert(job.id) {
                return Err(StoreError::Conflict(format!("job already exists: {}", job.id)));
            }
        }

        for job in &jobs {
            stored.insert(job.id, job.clone());
        }
        Ok(jobs)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read_jobs()?.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read_jobs()?;
        let mut result: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by_key(|j| j.id);
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn claim(
        &self,
        queue: &str,
        executor: ExecutorId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.write_jobs()?;

        let mut candidates: Vec<(i16, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.state == JobState::Available && j.queue == queue && j.is_due(now))
            .map(|j| (j.priority, j.scheduled_at, j.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, _, id) in candidates {
            if claimed.len() == limit {
                break;
            }
            if let Some(job) = jobs.get_mut(&id) {
                if job.claim(executor, now).is_ok() {
                    claimed.push(job.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn record_outcome(&self, job: &Job) -> Result<bool, StoreError> {
        let mut jobs = self.write_jobs()?;
        match jobs.get_mut(&job.id) {
            Some(stored)
                if stored.state == JobState::Executing && stored.attempted_by == job.attempted_by =>
            {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job.id)),
        }
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Cancelled>, StoreError> {
        let mut jobs = self.write_jobs()?;
        Ok(jobs.get_mut(&id).map(|job| {
            let prior = job.state;
            job.cancel(now);
            Cancelled {
                prior,
                job: job.clone(),
            }
        }))
    }

    async fn stage_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut jobs = self.write_jobs()?;

        let mut due: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.is_due(now))
            .map(|j| (j.scheduled_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut queues = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                if job.stage().is_ok() {
                    queues.push(job.queue.clone());
                }
            }
        }
        Ok(queues)
    }

    async fn heartbeat(&self, beat: &ExecutorHeartbeat) -> Result<(), StoreError> {
        self.executors()?.insert(beat.executor_id, beat.clone());
        Ok(())
    }

    async fn deregister(&self, executor: ExecutorId) -> Result<(), StoreError> {
        self.executors()?.remove(&executor);
        Ok(())
    }

    async fn orphaned(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let live: HashSet<ExecutorId> = self
            .executors()?
            .values()
            .filter(|b| b.heartbeat_at >= stale_before)
            .map(|b| b.executor_id)
            .collect();

        let jobs = self.read_jobs()?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.state == JobState::Executing
                    && j.attempted_by.is_none_or(|owner| !live.contains(&owner))
            })
            .cloned()
            .collect();
        result.sort_by_key(|j| j.attempted_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn prune(&self, before: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        let mut jobs = self.write_jobs()?;

        let mut old: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .filter_map(|j| j.terminal_at().filter(|at| *at < before).map(|at| (at, j.id)))
            .collect();
        old.sort();
        old.truncate(limit);

        for (_, id) in &old {
            jobs.remove(id);
        }
        Ok(old.len() as u64)
    }

    async fn prune_executors(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut executors = self.executors()?;
        let before = executors.len();
        executors.retain(|_, b| b.heartbeat_at >= stale_before);
        Ok((before - executors.len()) as u64)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, StoreError> {
        let jobs = self.read_jobs()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| queue.is_none_or(|q| j.queue == q)) {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }
}
