//! Jittered periodic tasks with explicit cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fraction of the interval added at random to every wait.
pub const JITTER: f64 = 0.1;

/// `interval` plus a random extra of up to `JITTER` of it.
///
/// Nodes started together drift apart instead of sweeping in lockstep.
pub fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(1.0 + JITTER * rand::random::<f64>())
}

/// Run `tick` every (jittered) `interval` until `shutdown` is cancelled.
///
/// The first tick happens after one interval. A tick in progress is allowed
/// to finish; cancellation is only observed between ticks.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered(interval)) => {
                    debug!(task = name, "tick");
                    tick().await;
                }
            }
        }

        info!(task = name, "periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let interval = Duration::from_millis(1_000);
        for _ in 0..200 {
            let d = jittered(interval);
            assert!(d >= interval);
            assert!(d <= Duration::from_millis(1_100));
        }
    }

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let counter = count.clone();
        let handle = spawn_periodic("test", Duration::from_millis(5), shutdown.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "ticked {seen} times");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
