//! Infrastructure layer: job storage, execution, sweeps and control plane.

pub mod config;
pub mod engine;
pub mod executor;
pub mod notifier;
pub mod periodic;
pub mod producer;
pub mod pruner;
pub mod rescuer;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig, QueueConfig, TestingMode};
pub use engine::{DrainReport, Engine, EngineHandle};
pub use executor::{
    ExecutorStats, FnWorker, JobContext, QueueExecutor, QueueExecutorHandle, Worker, WorkerRegistry,
};
pub use notifier::PostgresNotifier;
#[cfg(feature = "redis")]
pub use notifier::RedisPubSubNotifier;
pub use producer::{ProduceError, Producer};
pub use pruner::Pruner;
pub use rescuer::{RescueReport, Rescuer};
pub use scheduler::Scheduler;
pub use store::{
    Cancelled, ExecutorHeartbeat, InMemoryJobStore, Inserted, JobFilter, JobStats, JobStore, PostgresJobStore,
    StoreError,
};
