//! Running one attempt of a claimed job and settling its outcome.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use jobforge_core::{ErrorKind, Job, JobResult, Outcome, RetryPolicy, Transition};

use super::registry::{JobContext, Worker};

/// A finished attempt, before its outcome is applied to the row.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub job: Job,
    pub outcome: Outcome,
    /// Set when the attempt overran its timeout.
    pub timed_out: Option<Duration>,
    /// Worker-level retry delay for this attempt.
    pub backoff: Option<Duration>,
    pub elapsed: Duration,
}

impl Attempt {
    /// Apply the outcome to `self.job` under `policy`.
    pub fn settle(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> JobResult<Transition> {
        match self.timed_out {
            Some(limit) => {
                let reason = format!("job timed out after {}ms", limit.as_millis());
                self.job.apply_failure(ErrorKind::Timeout, &reason, policy, self.backoff, now)
            }
            None => self.job.apply_outcome(&self.outcome, policy, self.backoff, now),
        }
    }
}

/// Perform `job` with `worker`.
///
/// The worker runs on its own task so a panic becomes an `Outcome::Error`.
/// On timeout the job's token is cancelled and the attempt still waits for the
/// worker to return; nothing is preempted.
pub(crate) async fn run_attempt(
    worker: Option<Arc<dyn Worker>>,
    job: Job,
    cancel: CancellationToken,
    default_timeout: Option<Duration>,
) -> Attempt {
    let started = Instant::now();

    let Some(worker) = worker else {
        let outcome = Outcome::error(format!("unknown worker {:?}", job.worker));
        return Attempt {
            job,
            outcome,
            timed_out: None,
            backoff: None,
            elapsed: started.elapsed(),
        };
    };

    let timeout = worker.timeout().or(default_timeout);
    let ctx = JobContext::new(job.clone(), cancel.clone());
    let performer = worker.clone();
    let mut handle = tokio::spawn(async move { performer.perform(&ctx).await });

    let (joined, timed_out) = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => (joined, None),
            Err(_) => {
                cancel.cancel();
                (handle.await, Some(limit))
            }
        },
        None => (handle.await, None),
    };

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Outcome::error(format!("worker panicked: {}", panic_message(e.into_panic()))),
        Err(e) => Outcome::error(format!("worker task failed: {e}")),
    };

    Attempt {
        backoff: worker.backoff(job.attempt),
        job,
        outcome,
        timed_out,
        elapsed: started.elapsed(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map_or_else(|| "unknown panic".to_string(), |msg| msg.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use jobforge_core::{ExecutorId, JobState, NewJob};
    use serde_json::json;

    use super::*;
    use crate::executor::registry::WorkerRegistry;

    fn claimed() -> Job {
        let mut job = NewJob::new("mail", "Welcome", json!({})).build(Utc::now()).unwrap().job;
        job.claim(ExecutorId::new(), Utc::now()).unwrap();
        job
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn unknown_worker_is_an_error() {
        let mut attempt = run_attempt(None, claimed(), CancellationToken::new(), None).await;
        assert!(matches!(&attempt.outcome, Outcome::Error(msg) if msg.contains("unknown worker")));

        attempt.settle(&policy(), Utc::now()).unwrap();
        assert_eq!(attempt.job.state, JobState::Available);
        assert_eq!(attempt.job.errors[0].kind, ErrorKind::Error);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("Welcome", |_ctx| async { panic!("smtp exploded") });

        let attempt = run_attempt(registry.get("Welcome"), claimed(), CancellationToken::new(), None).await;
        assert!(matches!(&attempt.outcome, Outcome::Error(msg) if msg.contains("smtp exploded")));
    }

    #[tokio::test]
    async fn timeout_cancels_the_token_and_waits_for_the_worker() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("Welcome", |ctx| async move {
            ctx.cancelled().await;
            Outcome::Success
        });

        let token = CancellationToken::new();
        let mut attempt = run_attempt(
            registry.get("Welcome"),
            claimed(),
            token.clone(),
            Some(Duration::from_millis(20)),
        )
        .await;

        assert!(token.is_cancelled());
        assert_eq!(attempt.timed_out, Some(Duration::from_millis(20)));

        let now = Utc::now();
        attempt.settle(&policy(), now).unwrap();
        assert_eq!(attempt.job.state, JobState::Available);
        assert_eq!(attempt.job.errors[0].kind, ErrorKind::Timeout);
        assert_eq!(attempt.job.scheduled_at, now + ChronoDuration::seconds(10));
    }

    #[tokio::test]
    async fn worker_backoff_overrides_policy() {
        struct Slow;

        #[async_trait::async_trait]
        impl Worker for Slow {
            async fn perform(&self, _ctx: &JobContext) -> Outcome {
                Outcome::error("try later")
            }

            fn backoff(&self, attempt: u32) -> Option<Duration> {
                Some(Duration::from_secs(60 * u64::from(attempt)))
            }
        }

        let worker: Arc<dyn Worker> = Arc::new(Slow);
        let mut attempt = run_attempt(Some(worker), claimed(), CancellationToken::new(), None).await;
        assert_eq!(attempt.backoff, Some(Duration::from_secs(60)));

        let now = Utc::now();
        attempt.settle(&policy(), now).unwrap();
        assert_eq!(attempt.job.scheduled_at, now + ChronoDuration::seconds(60));
    }
}
