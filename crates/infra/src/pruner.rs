//! Pruner: bounds storage by deleting old terminal jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobforge_core::chrono_duration;
use jobforge_observability::{TelemetryEvent, TelemetrySink, TracingSink};

use crate::periodic::spawn_periodic;
use crate::store::{JobStore, StoreError};

/// Periodic prune sweep. Only `completed`, `discarded` and `cancelled` rows
/// are ever deleted.
pub struct Pruner {
    store: Arc<dyn JobStore>,
    telemetry: Arc<dyn TelemetrySink>,
    max_age: Duration,
    limit: usize,
}

impl Pruner {
    pub fn new(store: Arc<dyn JobStore>, max_age: Duration, limit: usize) -> Self {
        Self {
            store,
            telemetry: Arc::new(TracingSink),
            max_age,
            limit: limit.max(1),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Delete terminal rows older than `max_age`, batch by batch, until a
    /// batch comes back short. Returns the number of deleted rows.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = now - chrono_duration(self.max_age);
        let mut total = 0;

        loop {
            let deleted = self.store.prune(before, self.limit).await?;
            total += deleted;
            if deleted < self.limit as u64 {
                break;
            }
        }

        if total > 0 {
            debug!(pruned = total, "pruned terminal jobs");
        }
        Ok(total)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("pruner", interval, shutdown, move || {
            let pruner = self.clone();
            async move {
                if let Err(e) = pruner.sweep(Utc::now()).await {
                    warn!(sweep = "pruner", error = %e, "sweep failed");
                    pruner.telemetry.emit(&TelemetryEvent::SweepFailed {
                        sweep: "pruner".into(),
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
    use jobforge_core::{Job, JobState, NewJob};
    use serde_json::json;

    use super::*;
    use crate::store::InMemoryJobStore;

    fn finished(state: JobState, at: DateTime<Utc>) -> Job {
        let mut job = NewJob::new("mail", "Welcome", json!({})).build(at).unwrap().job;
        job.state = state;
        match state {
            JobState::Completed => job.completed_at = Some(at),
            JobState::Discarded => job.discarded_at = Some(at),
            JobState::Cancelled => job.cancelled_at = Some(at),
            _ => {}
        }
        job
    }

    #[tokio::test]
    async fn deletes_every_old_terminal_row_in_batches() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        let old = now - ChronoDuration::days(3);

        for state in [JobState::Completed, JobState::Discarded, JobState::Cancelled] {
            for _ in 0..3 {
                store.put(finished(state, old)).unwrap();
            }
        }
        let fresh = finished(JobState::Completed, now);
        store.put(fresh.clone()).unwrap();
        let waiting = finished(JobState::Available, old);
        store.put(waiting.clone()).unwrap();

        let pruner = Pruner::new(store.clone(), Duration::from_secs(86_400), 2);
        assert_eq!(pruner.sweep(now).await.unwrap(), 9);
        assert_eq!(store.len(), 2);
        assert!(store.get(fresh.id).await.unwrap().is_some());
        assert!(store.get(waiting.id).await.unwrap().is_some());

        assert_eq!(pruner.sweep(now).await.unwrap(), 0);
    }
}
