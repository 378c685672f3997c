//! Scheduler: promotes due `scheduled` jobs to `available`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobforge_events::{ControlCommand, Notifier};
use jobforge_observability::{TelemetryEvent, TelemetrySink, TracingSink};

use crate::periodic::spawn_periodic;
use crate::store::{JobStore, StoreError};

/// Periodic staging sweep.
///
/// Safe to run on every node at once: promotion is a conditional update, so a
/// row staged by one node is skipped by the others.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    telemetry: Arc<dyn TelemetrySink>,
    limit: usize,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            telemetry: Arc::new(TracingSink),
            limit: 1_000,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Stage due jobs and wake the executors of every queue that got some.
    ///
    /// Returns the number of promoted rows.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let queues = self.store.stage_scheduled(now, self.limit).await?;
        let staged = queues.len();

        let touched: BTreeSet<String> = queues.into_iter().collect();
        for queue in touched {
            if let Err(e) = self.notifier.publish(ControlCommand::rescan(queue.as_str())).await {
                debug!(%queue, error = %e, "rescan notification dropped");
            }
        }

        if staged > 0 {
            debug!(staged, "staged scheduled jobs");
        }
        Ok(staged)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("scheduler", interval, shutdown, move || {
            let scheduler = self.clone();
            async move {
                if let Err(e) = scheduler.sweep(Utc::now()).await {
                    warn!(sweep = "scheduler", error = %e, "sweep failed");
                    scheduler.telemetry.emit(&TelemetryEvent::SweepFailed {
                        sweep: "scheduler".into(),
                        error: e.to_string(),
                    });
                }
            }
        })
    }
}
