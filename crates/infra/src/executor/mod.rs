//! Job execution: worker registry, single attempts and per-queue executors.

mod attempt;
pub mod queue_executor;
pub mod registry;

pub(crate) use attempt::{run_attempt, Attempt};
pub use queue_executor::{ExecutorStats, QueueExecutor, QueueExecutorHandle};
pub use registry::{FnWorker, JobContext, Worker, WorkerRegistry};
