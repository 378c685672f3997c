//! Worker contract and the name → worker registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use jobforge_core::{Job, Outcome};

/// What a worker sees while performing a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Deserialize the job args into a typed payload.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.job.args_as()
    }

    /// Attempt number of this run (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    /// Whether the engine asked this attempt to stop (timeout, cancel, shutdown).
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the engine asks this attempt to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Domain capability that performs jobs of one worker name.
///
/// Workers must be safe to run more than once for the same job: execution is
/// at-least-once. Long-running work should check [`JobContext::is_cancelled`]
/// (or select on [`JobContext::cancelled`]) to honor timeouts and cancellation.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn perform(&self, ctx: &JobContext) -> Outcome;

    /// Execution timeout for this worker; overrides the queue default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Retry delay after failed `attempt`; `None` uses the engine policy.
    fn backoff(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Adapter turning an async closure into a [`Worker`].
pub struct FnWorker<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn perform(&self, ctx: &JobContext) -> Outcome {
        (self.f)(ctx.clone()).await
    }
}

/// Workers by name.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, worker: impl Worker + 'static) -> &mut Self {
        self.workers.insert(name.into(), Arc::new(worker));
        self
    }

    /// Register an async closure as a worker.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register(name, FnWorker { f })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("WorkerRegistry").field("workers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use jobforge_core::NewJob;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Deserialize)]
    struct Welcome {
        id: u64,
    }

    struct Mailer;

    #[async_trait]
    impl Worker for Mailer {
        async fn perform(&self, ctx: &JobContext) -> Outcome {
            match ctx.args_as::<Welcome>() {
                Ok(args) if args.id > 0 => Outcome::Success,
                Ok(_) => Outcome::discard("no such user"),
                Err(e) => Outcome::error(e.to_string()),
            }
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(30))
        }
    }

    fn ctx(args: serde_json::Value) -> JobContext {
        let job = NewJob::new("mail", "Welcome", args).build(Utc::now()).unwrap().job;
        JobContext::new(job, CancellationToken::new())
    }

    #[tokio::test]
    async fn looks_up_workers_by_name() {
        let mut registry = WorkerRegistry::new();
        registry
            .register("Welcome", Mailer)
            .register_fn("Noop", |_ctx| async { Outcome::Success });

        let worker = registry.get("Welcome").unwrap();
        assert_eq!(worker.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(worker.perform(&ctx(json!({"id": 7}))).await, Outcome::Success);
        assert_eq!(worker.perform(&ctx(json!({"id": 0}))).await, Outcome::discard("no such user"));
        assert!(matches!(worker.perform(&ctx(json!({}))).await, Outcome::Error(_)));

        let noop = registry.get("Noop").unwrap();
        assert_eq!(noop.backoff(3), None);
        assert_eq!(noop.perform(&ctx(json!({}))).await, Outcome::Success);

        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn context_reports_cancellation() {
        let ctx = ctx(json!({}));
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
    }
}
