//! Job lifecycle states.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Job execution state.
///
/// ```text
/// scheduled ──► available ──► executing ──► completed
///                  ▲              │    ├──► discarded
///                  └──────────────┘    └──► cancelled
/// ```
///
/// `completed`, `discarded` and `cancelled` are terminal. Any non-terminal
/// state may also move straight to `cancelled` through the cancel API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its `scheduled_at` to pass.
    Scheduled,
    /// Runnable once `scheduled_at <= now`.
    Available,
    /// Claimed by an executor.
    Executing,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts or was discarded by its worker.
    Discarded,
    /// Cancelled by its worker or the cancel API.
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Available,
        JobState::Executing,
        JobState::Completed,
        JobState::Discarded,
        JobState::Cancelled,
    ];

    pub const TERMINAL: [JobState; 3] =
        [JobState::Completed, JobState::Discarded, JobState::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Executing => "executing",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Scheduled, Available) => true,
            (Available, Executing) => true,
            (Executing, Available | Completed | Discarded | Cancelled) => true,
            (Scheduled | Available, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::InvalidState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for from in JobState::TERMINAL {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn executing_is_the_only_way_out_of_available_besides_cancel() {
        let exits: Vec<_> = JobState::ALL
            .into_iter()
            .filter(|to| JobState::Available.can_transition_to(*to))
            .collect();
        assert_eq!(exits, vec![JobState::Executing, JobState::Cancelled]);
    }

    #[test]
    fn state_strings_parse_back() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }
}
