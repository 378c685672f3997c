//! Per-queue executor: claims jobs, runs them under a concurrency limit and
//! records their outcomes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_core::{ExecutorId, Job, JobId, JobState, RetryPolicy, Transition};
use jobforge_events::{ControlCommand, ControlEnvelope, Notifier, Subscription};
use jobforge_observability::{TelemetryEvent, TelemetrySink, TracingSink};

use super::attempt::{run_attempt, Attempt};
use super::registry::WorkerRegistry;
use crate::config::QueueConfig;
use crate::store::{ExecutorHeartbeat, JobStore};

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_snoozed: u64,
    pub jobs_discarded: u64,
    pub jobs_cancelled: u64,
    pub running: usize,
    pub limit: usize,
    pub paused: bool,
    pub uptime_secs: u64,
}

/// Handle to a running [`QueueExecutor`].
#[derive(Debug)]
pub struct QueueExecutorHandle {
    id: ExecutorId,
    queue: String,
    started: Instant,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl QueueExecutorHandle {
    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop fetching, drain in-flight jobs and wait for the executor to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(queue = %self.queue, executor_id = %self.id, error = %e, "queue executor task failed");
        }
    }
}

/// Jobs currently running in one executor.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<Attempt>,
    tokens: HashMap<JobId, CancellationToken>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Runs the jobs of one queue.
///
/// Fetches whenever a slot is free (poll tick, completion, `Rescan`), keeps a
/// liveness heartbeat in the store and follows control commands for its
/// queue. Outcomes are written only while the row is still `executing` and
/// owned by this executor.
pub struct QueueExecutor {
    id: ExecutorId,
    node: String,
    queue: QueueConfig,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<WorkerRegistry>,
    policy: RetryPolicy,
    telemetry: Arc<dyn TelemetrySink>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    shutdown_grace: Duration,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl QueueExecutor {
    pub fn new(
        queue: QueueConfig,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            id: ExecutorId::new(),
            node: "local".to_string(),
            queue,
            store,
            notifier,
            registry,
            policy: RetryPolicy::default(),
            telemetry: Arc::new(TracingSink),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(15),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_intervals(mut self, poll: Duration, heartbeat: Duration) -> Self {
        self.poll_interval = poll;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    /// Start the executor loop on the current runtime.
    pub fn spawn(mut self) -> QueueExecutorHandle {
        self.queue.limit = self.queue.limit.max(1);
        // Subscribe before the task starts so no command published after
        // `spawn` returns is missed.
        let subscription = self.notifier.subscribe();
        let shutdown = CancellationToken::new();

        QueueExecutorHandle {
            id: self.id,
            queue: self.queue.name.clone(),
            started: Instant::now(),
            shutdown: shutdown.clone(),
            stats: self.stats.clone(),
            join: tokio::spawn(self.run(subscription, shutdown)),
        }
    }

    async fn run(mut self, mut subscription: Subscription<ControlEnvelope>, shutdown: CancellationToken) {
        info!(
            queue = %self.queue.name,
            executor_id = %self.id,
            node = %self.node,
            limit = self.queue.limit,
            paused = self.queue.paused,
            "queue executor started"
        );

        let started_at = Utc::now();
        let mut in_flight = InFlight::default();

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subscribed = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => self.beat(started_at).await,
                _ = poll.tick() => self.fetch(&mut in_flight).await,
                message = subscription.recv(), if subscribed => match message {
                    Some(envelope) => self.handle_command(envelope.into_command(), &mut in_flight).await,
                    None => {
                        debug!(queue = %self.queue.name, "control channel closed; polling only");
                        subscribed = false;
                    }
                },
                Some(joined) = in_flight.tasks.join_next(), if !in_flight.is_empty() => {
                    self.complete(joined, &mut in_flight).await;
                    self.fetch(&mut in_flight).await;
                }
            }
            self.publish_stats(&in_flight);
        }

        self.drain(&mut in_flight).await;

        if let Err(e) = self.store.deregister(self.id).await {
            warn!(queue = %self.queue.name, executor_id = %self.id, error = %e, "failed to deregister executor");
        }
        info!(queue = %self.queue.name, executor_id = %self.id, "queue executor stopped");
    }

    async fn beat(&self, started_at: DateTime<Utc>) {
        let beat = ExecutorHeartbeat {
            executor_id: self.id,
            node: self.node.clone(),
            queue: self.queue.name.clone(),
            started_at,
            heartbeat_at: Utc::now(),
        };
        if let Err(e) = self.store.heartbeat(&beat).await {
            warn!(queue = %self.queue.name, executor_id = %self.id, error = %e, "heartbeat failed");
        }
    }

    /// Claim as many jobs as there are free slots.
    async fn fetch(&self, in_flight: &mut InFlight) {
        if self.queue.paused {
            return;
        }
        let free = self.queue.limit.saturating_sub(in_flight.len());
        if free == 0 {
            return;
        }

        match self.store.claim(&self.queue.name, self.id, free, Utc::now()).await {
            Ok(jobs) => {
                for job in jobs {
                    self.dispatch(job, in_flight);
                }
            }
            Err(e) => warn!(queue = %self.queue.name, error = %e, "claim failed"),
        }
    }

    fn dispatch(&self, job: Job, in_flight: &mut InFlight) {
        debug!(
            queue = %job.queue,
            job_id = %job.id,
            worker = %job.worker,
            attempt = job.attempt,
            "claimed job"
        );
        self.telemetry.emit(&TelemetryEvent::JobStart {
            job_id: *job.id.as_uuid(),
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            attempt: job.attempt,
        });

        let token = CancellationToken::new();
        in_flight.tokens.insert(job.id, token.clone());
        let worker = self.registry.get(&job.worker);
        in_flight
            .tasks
            .spawn(run_attempt(worker, job, token, self.queue.timeout));
    }

    async fn complete(&self, joined: Result<Attempt, JoinError>, in_flight: &mut InFlight) {
        let mut attempt = match joined {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(queue = %self.queue.name, error = %e, "job task aborted; row left for rescue");
                return;
            }
        };
        in_flight.tokens.remove(&attempt.job.id);

        let transition = match attempt.settle(&self.policy, Utc::now()) {
            Ok(transition) => transition,
            Err(e) => {
                error!(queue = %self.queue.name, job_id = %attempt.job.id, error = %e, "cannot settle job");
                return;
            }
        };

        let job = &attempt.job;
        let (recorded, state) = match self.store.record_outcome(job).await {
            Ok(true) => (true, job.state.as_str().to_string()),
            Ok(false) => {
                let persisted = match self.store.get(job.id).await {
                    Ok(Some(row)) => row.state.as_str().to_string(),
                    _ => "unknown".to_string(),
                };
                debug!(
                    queue = %job.queue,
                    job_id = %job.id,
                    state = %persisted,
                    "job no longer owned by this executor; outcome dropped"
                );
                (false, persisted)
            }
            Err(e) => {
                warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    error = %e,
                    "failed to record outcome; row left for rescue"
                );
                (false, JobState::Executing.as_str().to_string())
            }
        };

        let outcome = if attempt.timed_out.is_some() {
            "timeout"
        } else {
            attempt.outcome.label()
        };
        if recorded {
            match transition {
                Transition::Complete => debug!(queue = %job.queue, job_id = %job.id, "job completed"),
                Transition::Retry { at } => info!(
                    queue = %job.queue,
                    job_id = %job.id,
                    worker = %job.worker,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    retry_at = %at,
                    outcome,
                    "job failed; retry scheduled"
                ),
                Transition::Discard => warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    worker = %job.worker,
                    attempt = job.attempt,
                    outcome,
                    "job discarded"
                ),
                Transition::Cancel => info!(queue = %job.queue, job_id = %job.id, "job cancelled by worker"),
                Transition::Snooze { at } => debug!(queue = %job.queue, job_id = %job.id, until = %at, "job snoozed"),
            }
        }

        self.telemetry.emit(&TelemetryEvent::JobStop {
            job_id: *job.id.as_uuid(),
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            attempt: job.attempt,
            duration: attempt.elapsed,
            outcome: outcome.to_string(),
            recorded,
            state,
        });

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.jobs_processed += 1;
        if !recorded {
            return;
        }
        match transition {
            Transition::Complete => stats.jobs_completed += 1,
            Transition::Retry { .. } => stats.jobs_retried += 1,
            Transition::Snooze { .. } => stats.jobs_snoozed += 1,
            Transition::Discard => stats.jobs_discarded += 1,
            Transition::Cancel => stats.jobs_cancelled += 1,
        }
    }

    async fn handle_command(&mut self, command: ControlCommand, in_flight: &mut InFlight) {
        if let ControlCommand::CancelJob { job_id } = &command {
            if let Some(token) = in_flight.tokens.get(job_id) {
                info!(queue = %self.queue.name, %job_id, "cancelling running job");
                token.cancel();
            }
            return;
        }
        if command.queue() != Some(self.queue.name.as_str()) {
            return;
        }

        match command {
            ControlCommand::Pause { .. } => {
                if !self.queue.paused {
                    info!(queue = %self.queue.name, "queue paused");
                }
                self.queue.paused = true;
            }
            ControlCommand::Resume { .. } => {
                if self.queue.paused {
                    info!(queue = %self.queue.name, "queue resumed");
                }
                self.queue.paused = false;
                self.fetch(in_flight).await;
            }
            ControlCommand::Scale { limit, .. } => {
                let limit = limit.max(1);
                info!(queue = %self.queue.name, from = self.queue.limit, to = limit, "queue scaled");
                self.queue.limit = limit;
                self.fetch(in_flight).await;
            }
            ControlCommand::Rescan { .. } => self.fetch(in_flight).await,
            ControlCommand::CancelJob { .. } => {}
        }
    }

    /// Wait for in-flight jobs, cancel the stragglers, then abandon the rest.
    async fn drain(&self, in_flight: &mut InFlight) {
        if in_flight.is_empty() {
            return;
        }
        info!(queue = %self.queue.name, in_flight = in_flight.len(), "draining in-flight jobs");

        self.settle_within(self.shutdown_grace, in_flight).await;
        if in_flight.is_empty() {
            return;
        }

        for token in in_flight.tokens.values() {
            token.cancel();
        }
        self.settle_within(self.shutdown_grace, in_flight).await;
        if in_flight.is_empty() {
            return;
        }

        warn!(
            queue = %self.queue.name,
            abandoned = in_flight.len(),
            "abandoning jobs that ignored cancellation; rows left for rescue"
        );
        in_flight.tasks.abort_all();
        while in_flight.tasks.join_next().await.is_some() {}
        self.publish_stats(in_flight);
    }

    async fn settle_within(&self, grace: Duration, in_flight: &mut InFlight) {
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        while !in_flight.is_empty() {
            tokio::select! {
                _ = &mut deadline => return,
                Some(joined) = in_flight.tasks.join_next() => {
                    self.complete(joined, in_flight).await;
                    self.publish_stats(in_flight);
                }
            }
        }
    }

    fn publish_stats(&self, in_flight: &InFlight) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.running = in_flight.len();
        stats.limit = self.queue.limit;
        stats.paused = self.queue.paused;
    }
}
