//! Producer: validates and persists new jobs.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use jobforge_core::{Job, JobError, JobId, JobState, NewJob};
use jobforge_events::{ControlCommand, Notifier};

use crate::store::{Inserted, JobStore, StoreError};

/// Producer operation error.
#[derive(Debug, Error)]
pub enum ProduceError {
    /// The job spec is malformed; retrying will not help.
    #[error(transparent)]
    Validation(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inserts and cancels jobs.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
}

impl Producer {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Insert one job.
    ///
    /// With unique options the store returns the existing job on conflict
    /// (after applying the replace policy) instead of writing a new row.
    pub async fn insert(&self, new: NewJob) -> Result<Inserted, ProduceError> {
        let prepared = new.build(Utc::now())?;

        let inserted = match &prepared.unique {
            Some(unique) => {
                self.store
                    .insert_unique(prepared.job, unique, &prepared.replace, Utc::now())
                    .await?
            }
            None => Inserted::Inserted(self.store.insert(prepared.job).await?),
        };

        let job = inserted.job();
        if inserted.is_conflict() {
            debug!(
                queue = %job.queue,
                worker = %job.worker,
                job_id = %job.id,
                state = %job.state,
                "unique conflict; existing job returned"
            );
        } else {
            debug!(queue = %job.queue, worker = %job.worker, job_id = %job.id, state = %job.state, "job inserted");
        }

        if job.state == JobState::Available {
            self.wake([job.queue.as_str()]).await;
        }
        Ok(inserted)
    }

    /// Insert many jobs in one store call.
    ///
    /// Every spec is validated before anything is written. Uniqueness is not
    /// checked here, although unique keys are still stored on the rows.
    pub async fn insert_all(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, ProduceError> {
        let now = Utc::now();
        let rows = jobs
            .into_iter()
            .map(|new| new.build(now).map(|prepared| prepared.job))
            .collect::<Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Ok(rows);
        }

        let inserted = self.store.insert_all(rows).await?;
        info!(count = inserted.len(), "jobs inserted");

        let queues: BTreeSet<&str> = inserted
            .iter()
            .filter(|job| job.state == JobState::Available)
            .map(|job| job.queue.as_str())
            .collect();
        self.wake(queues).await;
        Ok(inserted)
    }

    /// Cancel a job that has not finished.
    ///
    /// An executing job is marked `cancelled` right away and its executor is
    /// asked to fire the job's cancellation token; whatever the worker
    /// returns afterwards is ignored. Returns `None` for unknown ids.
    pub async fn cancel(&self, id: JobId) -> Result<Option<Job>, ProduceError> {
        let Some(cancelled) = self.store.cancel(id, Utc::now()).await? else {
            return Ok(None);
        };

        if cancelled.interrupted() {
            if let Err(e) = self.notifier.publish(ControlCommand::cancel_job(id)).await {
                debug!(job_id = %id, error = %e, "cancel notification dropped");
            }
        }
        let job = cancelled.job;
        info!(job_id = %job.id, queue = %job.queue, prior = %cancelled.prior, state = %job.state, "job cancel requested");
        Ok(Some(job))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn wake<'a>(&self, queues: impl IntoIterator<Item = &'a str>) {
        for queue in queues {
            if let Err(e) = self.notifier.publish(ControlCommand::rescan(queue)).await {
                debug!(%queue, error = %e, "rescan notification dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;
    use jobforge_core::{ExecutorId, ReplaceField, UniqueOpts};
    use jobforge_events::InMemoryNotifier;
    use serde_json::json;

    use super::*;
    use crate::store::{Cancelled, ExecutorHeartbeat, InMemoryJobStore, JobFilter, JobStats};

    fn producer() -> (Producer, Arc<InMemoryJobStore>, Arc<InMemoryNotifier>) {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::default());
        (Producer::new(store.clone(), notifier.clone()), store, notifier)
    }

    #[tokio::test]
    async fn insert_persists_and_wakes_the_queue() {
        let (producer, store, notifier) = producer();
        let mut sub = notifier.subscribe();

        let inserted = producer.insert(NewJob::new("mail", "Welcome", json!({"id": 1}))).await.unwrap();
        assert!(!inserted.is_conflict());
        assert_eq!(inserted.job().state, JobState::Available);
        assert!(store.get(inserted.job().id).await.unwrap().is_some());
        assert_eq!(sub.try_recv().unwrap().command(), &ControlCommand::rescan("mail"));

        // Scheduled jobs wait for the scheduler; nobody is woken.
        producer
            .insert(NewJob::new("mail", "Welcome", json!({})).schedule_in(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_specs_are_rejected_before_the_store() {
        let (producer, store, _) = producer();

        let err = producer.insert(NewJob::new("", "Welcome", json!({}))).await.unwrap_err();
        assert!(matches!(err, ProduceError::Validation(_)));

        let err = producer
            .insert_all(vec![
                NewJob::new("mail", "Welcome", json!({})),
                NewJob::new("mail", "Welcome", json!({})).priority(42),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unique_insert_returns_the_existing_job() {
        let (producer, store, _) = producer();
        let unique = || NewJob::new("mail", "Welcome", json!({"id": 1})).unique(UniqueOpts::for_period(Duration::from_secs(60)));

        let first = producer.insert(unique()).await.unwrap();
        let second = producer.insert(unique()).await.unwrap();
        assert!(second.is_conflict());
        assert_eq!(first.job().id, second.job().id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn insert_all_bypasses_uniqueness() {
        let (producer, store, _) = producer();
        let unique = || NewJob::new("mail", "Welcome", json!({"id": 1})).unique(UniqueOpts::new());

        let jobs = producer.insert_all(vec![unique(), unique()]).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].unique_key, jobs[1].unique_key);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn cancelling_an_executing_job_signals_its_executor() {
        let (producer, store, notifier) = producer();
        let job = producer.insert(NewJob::new("mail", "Welcome", json!({}))).await.unwrap().into_job();
        let mut sub = notifier.subscribe();

        store.claim("mail", ExecutorId::new(), 1, Utc::now()).await.unwrap();
        let cancelled = producer.cancel(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(sub.try_recv().unwrap().command(), &ControlCommand::cancel_job(job.id));

        // Already terminal: unchanged, nothing to signal.
        let again = producer.cancel(job.id).await.unwrap().unwrap();
        assert_eq!(again.cancelled_at, cancelled.cancelled_at);
        assert!(sub.try_recv().is_err());

        assert!(producer.cancel(JobId::new()).await.unwrap().is_none());
    }

    /// Claims the row for another executor just before cancelling it.
    struct ClaimBeforeCancel(InMemoryJobStore);

    #[async_trait]
    impl JobStore for ClaimBeforeCancel {
        async fn insert(&self, job: Job) -> Result<Job, StoreError> {
            self.0.insert(job).await
        }

        async fn insert_unique(
            &self,
            job: Job,
            unique: &UniqueOpts,
            replace: &[ReplaceField],
            now: DateTime<Utc>,
        ) -> Result<Inserted, StoreError> {
            self.0.insert_unique(job, unique, replace, now).await
        }

        async fn insert_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StoreError> {
            self.0.insert_all(jobs).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            self.0.get(id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
            self.0.list(filter).await
        }

        async fn claim(
            &self,
            queue: &str,
            executor: ExecutorId,
            limit: usize,
            now: DateTime<Utc>,
        ) -> Result<Vec<Job>, StoreError> {
            self.0.claim(queue, executor, limit, now).await
        }

        async fn record_outcome(&self, job: &Job) -> Result<bool, StoreError> {
            self.0.record_outcome(job).await
        }

        async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Cancelled>, StoreError> {
            if let Some(job) = self.0.get(id).await? {
                self.0.claim(&job.queue, ExecutorId::new(), 1, now).await?;
            }
            self.0.cancel(id, now).await
        }

        async fn stage_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
            self.0.stage_scheduled(now, limit).await
        }

        async fn heartbeat(&self, beat: &ExecutorHeartbeat) -> Result<(), StoreError> {
            self.0.heartbeat(beat).await
        }

        async fn deregister(&self, executor: ExecutorId) -> Result<(), StoreError> {
            self.0.deregister(executor).await
        }

        async fn orphaned(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
            self.0.orphaned(stale_before, limit).await
        }

        async fn prune(&self, before: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
            self.0.prune(before, limit).await
        }

        async fn prune_executors(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
            self.0.prune_executors(stale_before).await
        }

        async fn stats(&self, queue: Option<&str>) -> Result<JobStats, StoreError> {
            self.0.stats(queue).await
        }
    }

    #[tokio::test]
    async fn cancel_signals_a_job_claimed_while_cancelling() {
        let store = Arc::new(ClaimBeforeCancel(InMemoryJobStore::new()));
        let notifier = Arc::new(InMemoryNotifier::default());
        let producer = Producer::new(store.clone(), notifier.clone());

        let job = producer.insert(NewJob::new("mail", "Welcome", json!({}))).await.unwrap().into_job();
        assert_eq!(job.state, JobState::Available);
        let mut sub = notifier.subscribe();

        let cancelled = producer.cancel(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(sub.try_recv().unwrap().command(), &ControlCommand::cancel_job(job.id));
    }
}
