//! Engine: wires producer, executors and periodic sweeps for one node.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobforge_core::{ExecutorId, Job, JobId, JobState, NewJob, Transition};
use jobforge_events::{ControlCommand, InMemoryNotifier, Notifier, NotifyError};
use jobforge_observability::{TelemetrySink, TracingSink};

use crate::config::{ConfigError, EngineConfig, TestingMode};
use crate::executor::{run_attempt, ExecutorStats, QueueExecutor, QueueExecutorHandle, WorkerRegistry};
use crate::producer::{ProduceError, Producer};
use crate::pruner::Pruner;
use crate::rescuer::Rescuer;
use crate::scheduler::Scheduler;
use crate::store::{Inserted, JobStore, StoreError};

/// Engine builder.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>, registry: WorkerRegistry) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(registry),
            notifier: None,
            telemetry: Arc::new(TracingSink),
        }
    }

    /// Use a cross-node notifier; defaults to an in-process one.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validate the configuration and start every component.
    ///
    /// In `Manual` and `Inline` testing modes nothing runs in the background.
    pub fn start(self) -> Result<EngineHandle, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(InMemoryNotifier::new(config.node.clone())),
        };
        let producer = Producer::new(self.store.clone(), notifier.clone());
        let shutdown = CancellationToken::new();

        let mut executors = Vec::new();
        let mut sweeps = Vec::new();

        if config.testing == TestingMode::Disabled {
            for queue in &config.queues {
                let executor = QueueExecutor::new(
                    queue.clone(),
                    self.store.clone(),
                    notifier.clone(),
                    self.registry.clone(),
                )
                .with_node(config.node.clone())
                .with_policy(config.retry_policy.clone())
                .with_telemetry(self.telemetry.clone())
                .with_intervals(config.poll_interval, config.heartbeat_interval)
                .with_shutdown_grace(config.shutdown_grace);
                executors.push(executor.spawn());
            }

            let scheduler = Scheduler::new(self.store.clone(), notifier.clone())
                .with_limit(config.stage_limit)
                .with_telemetry(self.telemetry.clone());
            sweeps.push(Arc::new(scheduler).spawn(config.stage_interval, shutdown.child_token()));

            let rescuer = Rescuer::new(self.store.clone(), config.rescue_after)
                .with_policy(config.retry_policy.clone())
                .with_limit(config.rescue_limit)
                .with_telemetry(self.telemetry.clone());
            sweeps.push(Arc::new(rescuer).spawn(config.rescue_interval, shutdown.child_token()));

            let pruner = Pruner::new(self.store.clone(), config.prune_max_age, config.prune_limit)
                .with_telemetry(self.telemetry.clone());
            sweeps.push(Arc::new(pruner).spawn(config.prune_interval, shutdown.child_token()));
        }

        info!(
            node = %config.node,
            queues = config.queues.len(),
            testing = ?config.testing,
            "job engine started"
        );

        Ok(EngineHandle {
            config,
            store: self.store,
            registry: self.registry,
            notifier,
            producer,
            executors,
            sweeps,
            shutdown,
        })
    }
}

/// What [`EngineHandle::drain_queue`] ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub retried: usize,
    pub snoozed: usize,
    pub discarded: usize,
    pub cancelled: usize,
}

impl DrainReport {
    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Complete => self.completed += 1,
            Transition::Retry { .. } => self.retried += 1,
            Transition::Snooze { .. } => self.snoozed += 1,
            Transition::Discard => self.discarded += 1,
            Transition::Cancel => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.retried + self.snoozed + self.discarded + self.cancelled
    }
}

/// A running engine.
pub struct EngineHandle {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    notifier: Arc<dyn Notifier>,
    producer: Producer,
    executors: Vec<QueueExecutorHandle>,
    sweeps: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Insert a job; in `Inline` mode the worker runs right here instead.
    pub async fn insert(&self, new: NewJob) -> Result<Inserted, ProduceError> {
        match self.config.testing {
            TestingMode::Inline => self.perform_inline(new).await.map(Inserted::Inserted),
            _ => self.producer.insert(new).await,
        }
    }

    pub async fn cancel(&self, id: JobId) -> Result<Option<Job>, ProduceError> {
        self.producer.cancel(id).await
    }

    pub async fn pause(&self, queue: &str) -> Result<(), NotifyError> {
        self.notifier.publish(ControlCommand::pause(queue)).await
    }

    pub async fn resume(&self, queue: &str) -> Result<(), NotifyError> {
        self.notifier.publish(ControlCommand::resume(queue)).await
    }

    pub async fn scale(&self, queue: &str, limit: usize) -> Result<(), NotifyError> {
        self.notifier.publish(ControlCommand::scale(queue, limit)).await
    }

    /// Statistics of this node's executors, by queue.
    pub fn stats(&self) -> BTreeMap<String, ExecutorStats> {
        self.executors
            .iter()
            .map(|executor| (executor.queue().to_string(), executor.stats()))
            .collect()
    }

    /// Run every due job of `queue` to an outcome, one at a time, in the caller.
    ///
    /// Meant for `Manual` testing mode. Only jobs due when the drain starts
    /// are run; retries and snoozes are rescheduled past that point and are
    /// left for a later drain, even with a zero delay.
    pub async fn drain_queue(&self, queue: &str) -> Result<DrainReport, StoreError> {
        let executor = ExecutorId::new();
        let timeout = self.config.queue(queue).and_then(|q| q.timeout);
        let mut report = DrainReport::default();
        let cutoff = Utc::now();
        self.store.stage_scheduled(cutoff, self.config.stage_limit).await?;

        loop {
            let Some(job) = self.store.claim(queue, executor, 1, cutoff).await?.pop() else {
                break;
            };

            let worker = self.registry.get(&job.worker);
            let mut attempt = run_attempt(worker, job, CancellationToken::new(), timeout).await;
            match attempt.settle(&self.config.retry_policy, Utc::now()) {
                Ok(transition) => report.record(transition),
                Err(e) => {
                    warn!(job_id = %attempt.job.id, error = %e, "cannot settle drained job");
                    continue;
                }
            }
            self.store.record_outcome(&attempt.job).await?;
        }

        Ok(report)
    }

    async fn perform_inline(&self, new: NewJob) -> Result<Job, ProduceError> {
        let now = Utc::now();
        let mut job = new.build(now)?.job;
        if job.state == JobState::Scheduled {
            job.stage()?;
        }
        job.claim(ExecutorId::new(), now)?;

        let timeout = self.config.queue(&job.queue).and_then(|q| q.timeout);
        let worker = self.registry.get(&job.worker);
        let mut attempt = run_attempt(worker, job, CancellationToken::new(), timeout).await;
        attempt.settle(&self.config.retry_policy, Utc::now())?;
        Ok(attempt.job)
    }

    /// Stop sweeps, drain every executor and wait for all tasks to exit.
    pub async fn shutdown(self) {
        info!(node = %self.config.node, "job engine shutting down");
        self.shutdown.cancel();

        let draining: Vec<JoinHandle<()>> = self
            .executors
            .into_iter()
            .map(|executor| tokio::spawn(executor.shutdown()))
            .collect();
        for task in draining.into_iter().chain(self.sweeps) {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task failed during shutdown");
            }
        }

        info!(node = %self.config.node, "job engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jobforge_core::{ErrorKind, Outcome, RetryPolicy};
    use serde_json::json;

    use super::*;
    use crate::config::QueueConfig;
    use crate::store::InMemoryJobStore;
    use crate::testing::eventually;

    fn registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry
            .register_fn("Ok", |_ctx| async { Outcome::Success })
            .register_fn("Fail", |_ctx| async { Outcome::error("boom") });
        registry
    }

    fn config(testing: TestingMode) -> EngineConfig {
        EngineConfig::default()
            .with_node("node-test")
            .with_queues([QueueConfig::new("mail", 2)])
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_stage_interval(Duration::from_millis(10))
            .with_shutdown_grace(Duration::from_millis(50))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(60)))
            .with_testing(testing)
    }

    #[tokio::test]
    async fn runs_inserted_jobs_in_the_background() {
        let store = InMemoryJobStore::arc();
        let engine = Engine::new(config(TestingMode::Disabled), store.clone(), registry())
            .start()
            .unwrap();

        let job = engine.insert(NewJob::new("mail", "Ok", json!({}))).await.unwrap().into_job();
        let probe = store.clone();
        eventually(|| {
            let store = probe.clone();
            async move { store.get(job.id).await.unwrap().unwrap().state == JobState::Completed }
        })
        .await;

        assert_eq!(engine.stats()["mail"].jobs_completed, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn pause_through_the_handle_holds_jobs_back() {
        let store = InMemoryJobStore::arc();
        let engine = Engine::new(config(TestingMode::Disabled), store.clone(), registry())
            .start()
            .unwrap();

        // Let the executor take its first ticks, then pause it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.pause("mail").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.stats()["mail"].paused);

        let job = engine.insert(NewJob::new("mail", "Ok", json!({}))).await.unwrap().into_job();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Available);

        engine.resume("mail").await.unwrap();
        let probe = store.clone();
        eventually(|| {
            let store = probe.clone();
            async move { store.get(job.id).await.unwrap().unwrap().state == JobState::Completed }
        })
        .await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn inline_mode_performs_without_touching_the_store() {
        let store = InMemoryJobStore::arc();
        let engine = Engine::new(config(TestingMode::Inline), store.clone(), registry())
            .start()
            .unwrap();

        let done = engine.insert(NewJob::new("mail", "Ok", json!({}))).await.unwrap().into_job();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempt, 1);

        let failed = engine.insert(NewJob::new("mail", "Fail", json!({}))).await.unwrap().into_job();
        assert_eq!(failed.state, JobState::Available);
        assert_eq!(failed.errors[0].kind, ErrorKind::Error);

        let future = engine
            .insert(NewJob::new("mail", "Ok", json!({})).schedule_in(Duration::from_secs(3600)))
            .await
            .unwrap()
            .into_job();
        assert_eq!(future.state, JobState::Completed);

        assert!(store.is_empty());
        assert!(engine.stats().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn manual_mode_persists_until_drained() {
        let store = InMemoryJobStore::arc();
        let engine = Engine::new(config(TestingMode::Manual), store.clone(), registry())
            .start()
            .unwrap();

        let ok = engine.insert(NewJob::new("mail", "Ok", json!({}))).await.unwrap().into_job();
        let fail = engine.insert(NewJob::new("mail", "Fail", json!({}))).await.unwrap().into_job();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get(ok.id).await.unwrap().unwrap().state, JobState::Available);

        let report = engine.drain_queue("mail").await.unwrap();
        assert_eq!(report, DrainReport { completed: 1, retried: 1, ..DrainReport::default() });
        assert_eq!(store.get(ok.id).await.unwrap().unwrap().state, JobState::Completed);
        assert_eq!(store.get(fail.id).await.unwrap().unwrap().attempt, 1);

        // The retry is a minute out.
        assert_eq!(engine.drain_queue("mail").await.unwrap().total(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn drain_stops_at_jobs_snoozed_without_delay() {
        let store = InMemoryJobStore::arc();
        let mut registry = registry();
        registry.register_fn("Nap", |_ctx| async { Outcome::Snooze(Duration::ZERO) });
        let engine = Engine::new(config(TestingMode::Manual), store.clone(), registry)
            .start()
            .unwrap();

        let nap = engine.insert(NewJob::new("mail", "Nap", json!({}))).await.unwrap().into_job();
        let report = engine.drain_queue("mail").await.unwrap();
        assert_eq!(report, DrainReport { snoozed: 1, ..DrainReport::default() });

        let napped = store.get(nap.id).await.unwrap().unwrap();
        assert_eq!(napped.state, JobState::Available);
        assert_eq!(napped.attempt, 0);

        // A later drain picks it up again.
        assert_eq!(engine.drain_queue("mail").await.unwrap().snoozed, 1);
        engine.shutdown().await;
    }

    #[test]
    fn start_rejects_invalid_config() {
        let config = config(TestingMode::Disabled).with_queues([QueueConfig::new("mail", 0)]);
        let err = Engine::new(config, InMemoryJobStore::arc(), registry()).start().err();
        assert!(matches!(err, Some(ConfigError::Invalid(_))));
    }
}
