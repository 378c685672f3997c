//! Job telemetry hook points.
//!
//! The engine emits an event when a job attempt starts, when it stops (with
//! its outcome and duration), and when a periodic sweep fails. Where the events
//! go is up to the host: the default `TracingSink` turns them into log lines,
//! `MemorySink` keeps them for inspection.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// A telemetry event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    JobStart {
        job_id: Uuid,
        queue: String,
        worker: String,
        attempt: u32,
    },
    JobStop {
        job_id: Uuid,
        queue: String,
        worker: String,
        attempt: u32,
        duration: Duration,
        /// `success`, `error`, `timeout`, `snooze`, `cancel` or `discard`.
        outcome: String,
        /// False when the row had already moved on (cancelled or rescued) and
        /// the outcome was dropped.
        recorded: bool,
        /// Row state as persisted after the attempt.
        state: String,
    },
    SweepFailed {
        sweep: String,
        error: String,
    },
}

/// Receiver of telemetry events.
///
/// Called inline on engine tasks, so implementations should be cheap and
/// must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::JobStart {
                job_id,
                queue,
                worker,
                attempt,
            } => {
                ::tracing::debug!(%job_id, %queue, %worker, attempt, "job started");
            }
            TelemetryEvent::JobStop {
                job_id,
                queue,
                worker,
                attempt,
                duration,
                outcome,
                recorded,
                state,
            } => {
                ::tracing::info!(
                    %job_id,
                    %queue,
                    %worker,
                    attempt,
                    duration_ms = duration.as_millis() as u64,
                    %outcome,
                    recorded,
                    %state,
                    "job stopped"
                );
            }
            TelemetryEvent::SweepFailed { sweep, error } => {
                ::tracing::warn!(%sweep, %error, "sweep failed");
            }
        }
    }
}

/// Sink that records events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Outcomes of recorded `JobStop` events, in order.
    pub fn stop_outcomes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TelemetryEvent::JobStop { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_stop_outcomes_in_order() {
        let sink = MemorySink::new();
        let job_id = Uuid::now_v7();
        for outcome in ["error", "success"] {
            sink.emit(&TelemetryEvent::JobStop {
                job_id,
                queue: "mail".into(),
                worker: "Welcome".into(),
                attempt: 1,
                duration: Duration::from_millis(3),
                outcome: outcome.into(),
                recorded: true,
                state: "available".into(),
            });
        }
        sink.emit(&TelemetryEvent::SweepFailed {
            sweep: "pruner".into(),
            error: "db down".into(),
        });

        assert_eq!(sink.stop_outcomes(), vec!["error", "success"]);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(TelemetryEvent::SweepFailed {
            sweep: "rescuer".into(),
            error: "timeout".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "sweep_failed");
        assert_eq!(json["sweep"], "rescuer");
    }
}
