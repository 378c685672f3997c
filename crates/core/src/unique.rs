//! Uniqueness constraints and the replace-on-conflict policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::error::{JobError, JobResult};
use crate::retry::chrono_duration;
use crate::state::JobState;

/// Job attributes that can take part in a uniqueness signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueField {
    Queue,
    Worker,
    Args,
}

/// Job attributes that a conflicting insert may overwrite on the existing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceField {
    Args,
    MaxAttempts,
    Meta,
    Priority,
    ScheduledAt,
    Tags,
}

/// Uniqueness options for a single insert.
///
/// Two jobs conflict when their signatures match, the existing job's state is
/// in `states`, and (if `period` is set) it was inserted within the period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueOpts {
    /// Look-back window on `inserted_at`; `None` means forever.
    pub period: Option<Duration>,
    /// Attributes hashed into the signature.
    pub fields: Vec<UniqueField>,
    /// Restrict the `args` part of the signature to these top-level keys.
    pub keys: Option<Vec<String>>,
    /// States of existing jobs that count as conflicts.
    pub states: Vec<JobState>,
}

impl Default for UniqueOpts {
    fn default() -> Self {
        Self {
            period: None,
            fields: vec![UniqueField::Queue, UniqueField::Worker, UniqueField::Args],
            keys: None,
            states: vec![
                JobState::Scheduled,
                JobState::Available,
                JobState::Executing,
                JobState::Completed,
            ],
        }
    }
}

impl UniqueOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique for `period` after the first insert.
    pub fn for_period(period: Duration) -> Self {
        Self {
            period: Some(period),
            ..Self::default()
        }
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = UniqueField>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn validate(&self) -> JobResult<()> {
        if self.period.is_some_and(|p| p.is_zero()) {
            return Err(JobError::validation("unique period must be positive"));
        }
        if self.fields.is_empty() {
            return Err(JobError::validation("unique fields must not be empty"));
        }
        if self.states.is_empty() {
            return Err(JobError::validation("unique states must not be empty"));
        }
        if self.keys.is_some() && !self.fields.contains(&UniqueField::Args) {
            return Err(JobError::validation("unique keys require the args field"));
        }
        Ok(())
    }

    /// Oldest `inserted_at` that still conflicts, or `None` for an unbounded period.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.period.map(|p| now - chrono_duration(p))
    }

    /// Hex SHA-256 over a canonical JSON rendering of the selected attributes.
    pub fn signature(&self, queue: &str, worker: &str, args: &JsonValue) -> String {
        let mut doc = Map::new();
        for field in &self.fields {
            match field {
                UniqueField::Queue => {
                    doc.insert("queue".into(), JsonValue::String(queue.to_string()));
                }
                UniqueField::Worker => {
                    doc.insert("worker".into(), JsonValue::String(worker.to_string()));
                }
                UniqueField::Args => {
                    doc.insert("args".into(), self.selected_args(args));
                }
            }
        }

        let canonical = canonicalize(&JsonValue::Object(doc)).to_string();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    fn selected_args(&self, args: &JsonValue) -> JsonValue {
        match (&self.keys, args) {
            (Some(keys), JsonValue::Object(map)) => JsonValue::Object(
                map.iter()
                    .filter(|(k, _)| keys.iter().any(|key| key == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => args.clone(),
        }
    }
}

/// Rebuild objects with sorted keys so equal documents render identically.
fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            JsonValue::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), canonicalize(&map[k])))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_ignores_key_order() {
        let opts = UniqueOpts::new();
        let a = opts.signature("mail", "Welcome", &json!({"id": 1, "lang": "en"}));
        let b = opts.signature("mail", "Welcome", &json!({"lang": "en", "id": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_changes_with_selected_fields_only() {
        let opts = UniqueOpts::new().with_fields([UniqueField::Worker, UniqueField::Args]);
        let a = opts.signature("mail", "Welcome", &json!({"id": 1}));
        let b = opts.signature("other", "Welcome", &json!({"id": 1}));
        let c = opts.signature("mail", "Welcome", &json!({"id": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keys_restrict_args() {
        let opts = UniqueOpts::new().with_keys(["id"]);
        let a = opts.signature("mail", "Welcome", &json!({"id": 1, "sent": "mon"}));
        let b = opts.signature("mail", "Welcome", &json!({"id": 1, "sent": "tue"}));
        assert_eq!(a, b);
    }

    #[test]
    fn validation_rejects_degenerate_options() {
        assert!(UniqueOpts::for_period(Duration::ZERO).validate().is_err());
        assert!(UniqueOpts::new().with_states(Vec::new()).validate().is_err());
        assert!(
            UniqueOpts::new()
                .with_fields([UniqueField::Queue])
                .with_keys(["id"])
                .validate()
                .is_err()
        );
        assert!(UniqueOpts::for_period(Duration::from_secs(60)).validate().is_ok());
    }
}
