//! Operational commands carried by the control plane.

use serde::{Deserialize, Serialize};

use jobforge_core::JobId;

/// A command broadcast to every live queue executor.
///
/// Commands only change operational behaviour (pausing, scaling, waking up
/// fetch loops, signalling cooperative cancellation). Losing one delays its
/// effect but never corrupts job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Stop claiming new jobs from `queue`.
    Pause { queue: String },
    /// Resume claiming from `queue`.
    Resume { queue: String },
    /// Change the per-executor concurrency limit of `queue`.
    Scale { queue: String, limit: usize },
    /// Fetch from `queue` now instead of waiting for the next poll.
    Rescan { queue: String },
    /// Fire the cancellation token of a running job, wherever it runs.
    CancelJob { job_id: JobId },
}

impl ControlCommand {
    pub fn pause(queue: impl Into<String>) -> Self {
        Self::Pause {
            queue: queue.into(),
        }
    }

    pub fn resume(queue: impl Into<String>) -> Self {
        Self::Resume {
            queue: queue.into(),
        }
    }

    pub fn scale(queue: impl Into<String>, limit: usize) -> Self {
        Self::Scale {
            queue: queue.into(),
            limit,
        }
    }

    pub fn rescan(queue: impl Into<String>) -> Self {
        Self::Rescan {
            queue: queue.into(),
        }
    }

    pub fn cancel_job(job_id: JobId) -> Self {
        Self::CancelJob { job_id }
    }

    /// Queue the command targets; `None` for job-level commands.
    pub fn queue(&self) -> Option<&str> {
        match self {
            ControlCommand::Pause { queue }
            | ControlCommand::Resume { queue }
            | ControlCommand::Scale { queue, .. }
            | ControlCommand::Rescan { queue } => Some(queue),
            ControlCommand::CancelJob { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_with_an_action_tag() {
        let json = serde_json::to_value(ControlCommand::scale("mail", 4)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "scale", "queue": "mail", "limit": 4})
        );

        let back: ControlCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back.queue(), Some("mail"));
    }

    #[test]
    fn job_commands_have_no_queue() {
        assert_eq!(ControlCommand::cancel_job(JobId::new()).queue(), None);
    }
}
