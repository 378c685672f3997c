use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::ControlCommand;

/// Envelope for a control command, carrying delivery metadata.
///
/// Notes:
/// - `origin` names the node that published the command (useful in logs when
///   commands cross nodes).
/// - `message_id` lets subscribers drop duplicates from at-least-once transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    message_id: Uuid,
    origin: String,
    sent_at: DateTime<Utc>,
    command: ControlCommand,
}

impl ControlEnvelope {
    pub fn new(origin: impl Into<String>, command: ControlCommand) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            origin: origin.into(),
            sent_at: Utc::now(),
            command,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn command(&self) -> &ControlCommand {
        &self.command
    }

    pub fn into_command(self) -> ControlCommand {
        self.command
    }
}
