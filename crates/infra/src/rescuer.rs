//! Rescuer: recovers jobs whose executor died mid-attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobforge_core::{chrono_duration, ErrorKind, RetryPolicy};
use jobforge_observability::{TelemetryEvent, TelemetrySink, TracingSink};

use crate::periodic::spawn_periodic;
use crate::store::{JobStore, StoreError};

/// What one rescue sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescueReport {
    /// Orphaned rows moved out of `executing`.
    pub rescued: usize,
    /// Stale executor heartbeats removed.
    pub executors_pruned: u64,
}

/// Periodic orphan sweep.
///
/// A row is orphaned when it is `executing` and the executor that claimed it
/// has not heartbeated for `rescue_after`. Each orphan is settled as a failed
/// attempt, so it is retried with backoff or discarded when out of attempts.
/// Rows of live executors are never touched, however long they run.
pub struct Rescuer {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    telemetry: Arc<dyn TelemetrySink>,
    rescue_after: Duration,
    limit: usize,
}

impl Rescuer {
    pub fn new(store: Arc<dyn JobStore>, rescue_after: Duration) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            telemetry: Arc::new(TracingSink),
            rescue_after,
            limit: 1_000,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RescueReport, StoreError> {
        let stale_before = now - chrono_duration(self.rescue_after);
        let orphans = self.store.orphaned(stale_before, self.limit).await?;

        let mut report = RescueReport::default();
        for mut job in orphans {
            let owner = job
                .attempted_by
                .map_or_else(|| "unknown".to_string(), |id| id.to_string());
            let reason = format!("executor {owner} stopped heartbeating during attempt {}", job.attempt);

            if let Err(e) = job.apply_failure(ErrorKind::Orphaned, &reason, &self.policy, None, now) {
                warn!(job_id = %job.id, error = %e, "cannot settle orphaned job");
                continue;
            }

            if self.store.record_outcome(&job).await? {
                report.rescued += 1;
                info!(
                    job_id = %job.id,
                    queue = %job.queue,
                    worker = %job.worker,
                    attempt = job.attempt,
                    state = %job.state,
                    "rescued orphaned job"
                );
            }
        }

        report.executors_pruned = self.store.prune_executors(stale_before).await?;
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("rescuer", interval, shutdown, move || {
            let rescuer = self.clone();
            async move {
                if let Err(e) = rescuer.sweep(Utc::now()).await {
                    warn!(sweep = "rescuer", error = %e, "sweep failed");
                    rescuer.telemetry.emit(&TelemetryEvent::SweepFailed {
                        sweep: "rescuer".into(),
                        error: e.to_string(),
                    });
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use jobforge_core::{ExecutorId, JobState, NewJob};
    use serde_json::json;

    use super::*;
    use crate::store::{ExecutorHeartbeat, InMemoryJobStore};

    fn beat(executor: ExecutorId, at: DateTime<Utc>) -> ExecutorHeartbeat {
        ExecutorHeartbeat {
            executor_id: executor,
            node: "node-a".into(),
            queue: "mail".into(),
            started_at: at,
            heartbeat_at: at,
        }
    }

    #[tokio::test]
    async fn rescues_only_rows_of_dead_executors() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        let live = ExecutorId::new();
        let dead = ExecutorId::new();

        for n in 0..2 {
            let job = NewJob::new("mail", "Welcome", json!({ "n": n })).build(now).unwrap().job;
            store.insert(job).await.unwrap();
        }
        let mine = store.claim("mail", live, 1, now).await.unwrap().remove(0);
        let lost = store.claim("mail", dead, 1, now).await.unwrap().remove(0);

        store.heartbeat(&beat(live, now)).await.unwrap();
        store.heartbeat(&beat(dead, now - ChronoDuration::minutes(10))).await.unwrap();

        let rescuer = Rescuer::new(store.clone(), Duration::from_secs(60))
            .with_policy(RetryPolicy::fixed(Duration::from_secs(5)));
        let report = rescuer.sweep(now).await.unwrap();
        assert_eq!(report, RescueReport { rescued: 1, executors_pruned: 1 });

        let rescued = store.get(lost.id).await.unwrap().unwrap();
        assert_eq!(rescued.state, JobState::Available);
        assert_eq!(rescued.attempt, 1);
        assert_eq!(rescued.errors.len(), 1);
        assert_eq!(rescued.errors[0].kind, ErrorKind::Orphaned);
        assert_eq!(rescued.scheduled_at, now + ChronoDuration::seconds(5));

        assert_eq!(store.get(mine.id).await.unwrap().unwrap().state, JobState::Executing);
    }

    #[tokio::test]
    async fn exhausted_orphans_are_discarded() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        let job = NewJob::new("mail", "Welcome", json!({})).max_attempts(1).build(now).unwrap().job;
        store.insert(job.clone()).await.unwrap();
        // Claimed by an executor that never heartbeated at all.
        store.claim("mail", ExecutorId::new(), 1, now).await.unwrap();

        let report = Rescuer::new(store.clone(), Duration::from_secs(60)).sweep(now).await.unwrap();
        assert_eq!(report.rescued, 1);

        let discarded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(discarded.state, JobState::Discarded);
        assert_eq!(discarded.attempt, discarded.max_attempts);
        assert!(discarded.discarded_at.is_some());
    }
}
