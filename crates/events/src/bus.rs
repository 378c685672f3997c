//! Control-plane publish/subscribe abstraction (mechanics only).
//!
//! The notifier is the **broadcast channel** used to steer running executors:
//! pause/resume a queue, change its concurrency, wake its fetch loop, or
//! signal cooperative cancellation of a running job.
//!
//! ## Delivery
//!
//! - **Best effort**: a subscriber that is offline when a command is
//!   published never sees it. Nothing in job execution depends on delivery;
//!   the store is the source of truth.
//! - **Broadcast**: every subscription gets a copy of every command, including
//!   the publisher's own subscriptions.
//! - **No ordering across publishers**.
//!
//! Subscribers must treat commands as idempotent: pausing a paused queue or
//! rescanning twice is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::command::ControlCommand;
use crate::envelope::ControlEnvelope;

/// A subscription to the control channel.
///
/// Designed for a single consumer task (one per queue executor).
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message; `None` once the notifier is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Notifier operation error.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier closed")]
    Closed,

    #[error("notifier transport error: {0}")]
    Transport(String),

    #[error("failed to encode control message: {0}")]
    Serialize(String),
}

/// Broadcast channel for control commands.
///
/// Implementations:
/// - in-memory fan-out within one process (`InMemoryNotifier`)
/// - store-backed fan-out across nodes (Postgres `NOTIFY`, Redis pub/sub)
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a command to every live subscriber.
    async fn publish(&self, command: ControlCommand) -> Result<(), NotifyError>;

    /// Open a new subscription.
    fn subscribe(&self) -> Subscription<ControlEnvelope>;
}

#[async_trait]
impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn publish(&self, command: ControlCommand) -> Result<(), NotifyError> {
        (**self).publish(command).await
    }

    fn subscribe(&self) -> Subscription<ControlEnvelope> {
        (**self).subscribe()
    }
}
