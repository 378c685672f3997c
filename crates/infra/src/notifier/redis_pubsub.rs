//! Redis pub/sub notifier (feature `redis`).
//!
//! Redis pub/sub is fire-and-forget: a node that is disconnected while a
//! command is published never sees it, which is all the control plane needs.

use std::sync::{Arc, Weak};
use std::thread;

use async_trait::async_trait;
use redis::Commands;
use tracing::{debug, warn};

use jobforge_events::{
    ControlCommand, ControlEnvelope, InMemoryNotifier, Notifier, NotifyError, Subscription,
};

use super::{decode, encode, DEFAULT_CHANNEL};

/// Broadcasts control commands over a Redis channel.
#[derive(Debug)]
pub struct RedisPubSubNotifier {
    client: redis::Client,
    channel: String,
    local: Arc<InMemoryNotifier>,
}

impl RedisPubSubNotifier {
    pub fn new(redis_url: impl AsRef<str>, node: impl Into<String>) -> Result<Self, NotifyError> {
        Self::with_channel(redis_url, node, DEFAULT_CHANNEL)
    }

    pub fn with_channel(
        redis_url: impl AsRef<str>,
        node: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;
        let channel = channel.into();
        let local = Arc::new(InMemoryNotifier::new(node));

        // Background thread that receives pub/sub messages and forwards them
        // to local subscriptions until the notifier is dropped.
        let listener = client.clone();
        let name = channel.clone();
        let target = Arc::downgrade(&local);
        thread::Builder::new()
            .name("jobforge-redis-control".to_string())
            .spawn(move || forward(listener, name, target))
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            channel,
            local,
        })
    }
}

fn forward(client: redis::Client, channel: String, local: Weak<InMemoryNotifier>) {
    let mut conn = match client.get_connection() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "redis control listener could not connect");
            return;
        }
    };

    let mut pubsub = conn.as_pubsub();
    if let Err(e) = pubsub.subscribe(&channel) {
        warn!(%channel, error = %e, "redis control subscribe failed");
        return;
    }

    loop {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "redis control listener stopped");
                return;
            }
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let Some(envelope) = decode(&payload) else {
            continue;
        };

        let Some(local) = local.upgrade() else {
            return;
        };
        debug!(origin = %envelope.origin(), command = ?envelope.command(), "control command received");
        if local.deliver(envelope).is_err() {
            return;
        }
    }
}

fn transport(e: redis::RedisError) -> NotifyError {
    NotifyError::Transport(e.to_string())
}

#[async_trait]
impl Notifier for RedisPubSubNotifier {
    async fn publish(&self, command: ControlCommand) -> Result<(), NotifyError> {
        let payload = encode(&ControlEnvelope::new(self.local.node(), command))?;
        let client = self.client.clone();
        let channel = self.channel.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection().map_err(transport)?;
            let _: i64 = conn.publish(&channel, payload).map_err(transport)?;
            Ok(())
        })
        .await
        .map_err(|e| NotifyError::Transport(e.to_string()))?
    }

    fn subscribe(&self) -> Subscription<ControlEnvelope> {
        self.local.subscribe()
    }
}
