//! Postgres `NOTIFY`/`LISTEN` notifier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use jobforge_events::{
    ControlCommand, ControlEnvelope, InMemoryNotifier, Notifier, NotifyError, Subscription,
};

use super::{decode, encode, DEFAULT_CHANNEL};

/// Broadcasts control commands through `pg_notify` on one channel.
///
/// A single `LISTEN` connection per process feeds every local subscription.
/// Commands published while that connection is down are lost; executors fall
/// back to polling.
pub struct PostgresNotifier {
    pool: PgPool,
    channel: String,
    local: Arc<InMemoryNotifier>,
    listener: JoinHandle<()>,
}

impl PostgresNotifier {
    /// Listen on the default channel.
    pub async fn connect(pool: &PgPool, node: impl Into<String>) -> Result<Self, NotifyError> {
        Self::connect_channel(pool, node, DEFAULT_CHANNEL).await
    }

    pub async fn connect_channel(
        pool: &PgPool,
        node: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, NotifyError> {
        let channel = channel.into();
        let mut listener = PgListener::connect_with(pool).await.map_err(transport)?;
        listener.listen(&channel).await.map_err(transport)?;

        let local = Arc::new(InMemoryNotifier::new(node));
        info!(%channel, node = %local.node(), "listening for control commands");
        let listener = tokio::spawn(forward(listener, local.clone()));

        Ok(Self {
            pool: pool.clone(),
            channel,
            local,
            listener,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn forward(mut listener: PgListener, local: Arc<InMemoryNotifier>) {
    loop {
        match listener.recv().await {
            Ok(notification) => {
                let Some(envelope) = decode(notification.payload()) else {
                    continue;
                };
                debug!(origin = %envelope.origin(), command = ?envelope.command(), "control command received");
                if local.deliver(envelope).is_err() {
                    return;
                }
            }
            Err(e) => {
                // The listener reconnects on the next `recv`.
                warn!(error = %e, "control listener error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn transport(e: sqlx::Error) -> NotifyError {
    NotifyError::Transport(e.to_string())
}

#[async_trait]
impl Notifier for PostgresNotifier {
    #[instrument(skip(self), fields(channel = %self.channel), err)]
    async fn publish(&self, command: ControlCommand) -> Result<(), NotifyError> {
        let payload = encode(&ControlEnvelope::new(self.local.node(), command))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(transport)?;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<ControlEnvelope> {
        self.local.subscribe()
    }
}

impl Drop for PostgresNotifier {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
