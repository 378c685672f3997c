//! In-memory notifier for single-process deployments and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{Notifier, NotifyError, Subscription};
use crate::command::ControlCommand;
use crate::envelope::ControlEnvelope;

/// In-memory pub/sub notifier.
///
/// - No IO
/// - Best-effort fan-out; closed subscriptions are dropped on publish
#[derive(Debug)]
pub struct InMemoryNotifier {
    node: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ControlEnvelope>>>,
}

impl InMemoryNotifier {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Node name stamped on published envelopes.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Number of open subscriptions (as of the last publish).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Hand an already-built envelope to every local subscriber.
    ///
    /// Used by transport-backed notifiers to fan out what they receive.
    pub fn deliver(&self, envelope: ControlEnvelope) -> Result<(), NotifyError> {
        let mut subs = self.subscribers.lock().map_err(|_| NotifyError::Closed)?;

        // Drop any dead subscribers while delivering.
        subs.retain(|tx| tx.send(envelope.clone()).is_ok());

        Ok(())
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, command: ControlCommand) -> Result<(), NotifyError> {
        self.deliver(ControlEnvelope::new(self.node.clone(), command))
    }

    fn subscribe(&self) -> Subscription<ControlEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let notifier = InMemoryNotifier::new("node-a");
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.publish(ControlCommand::pause("mail")).await.unwrap();

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.command(), &ControlCommand::pause("mail"));
        assert_eq!(got_a.message_id(), got_b.message_id());
        assert_eq!(got_a.origin(), "node-a");
    }

    #[tokio::test]
    async fn closed_subscriptions_are_pruned() {
        let notifier = InMemoryNotifier::default();
        let kept = notifier.subscribe();
        drop(notifier.subscribe());

        notifier.publish(ControlCommand::rescan("mail")).await.unwrap();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(kept);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let notifier = InMemoryNotifier::default();
        assert!(notifier.publish(ControlCommand::resume("mail")).await.is_ok());
    }
}
