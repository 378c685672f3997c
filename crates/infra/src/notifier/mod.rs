//! Cross-node notifiers.
//!
//! Both transports fan received envelopes out through a local
//! [`InMemoryNotifier`](jobforge_events::InMemoryNotifier), so every
//! subscription in the process sees every command exactly as published.

pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use postgres::PostgresNotifier;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubNotifier;

use jobforge_events::{ControlEnvelope, NotifyError};

/// Default channel name for control messages.
pub const DEFAULT_CHANNEL: &str = "jobforge_control";

pub(crate) fn encode(envelope: &ControlEnvelope) -> Result<String, NotifyError> {
    serde_json::to_string(envelope).map_err(|e| NotifyError::Serialize(e.to_string()))
}

pub(crate) fn decode(payload: &str) -> Option<ControlEnvelope> {
    match serde_json::from_str(payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed control message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use jobforge_events::ControlCommand;

    use super::*;

    #[test]
    fn envelopes_survive_the_wire() {
        let envelope = ControlEnvelope::new("node-a", ControlCommand::scale("mail", 3));
        let payload = encode(&envelope).unwrap();
        assert_eq!(decode(&payload), Some(envelope));
    }

    #[test]
    fn garbage_is_dropped() {
        assert_eq!(decode("{\"action\":\"reboot\"}"), None);
        assert_eq!(decode("not json"), None);
    }
}
