//! Retry policy: backoff computation and outcome resolution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::outcome::Outcome;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Maximum delay cap, jitter included
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the delay is spread uniformly by +/- this fraction
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(15),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

/// State change computed for a job leaving `executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Complete,
    Retry { at: DateTime<Utc> },
    Discard,
    Cancel,
    Snooze { at: DateTime<Utc> },
}

impl RetryPolicy {
    /// Create a policy with fixed delays and no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // Past ~1k doublings every sane cap has long been reached.
                let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1).min(1024) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        delay_ms.min(max_ms)
    }

    fn jitter_fraction(&self) -> f64 {
        self.jitter.clamp(0.0, 1.0)
    }

    /// Lower and upper bound of the jittered delay for a given attempt (1-indexed).
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        if attempt == 0 {
            return (Duration::ZERO, Duration::ZERO);
        }
        let delay_ms = self.raw_delay_ms(attempt);
        let spread = delay_ms * self.jitter_fraction();
        let max_ms = self.max_delay.as_millis() as f64;
        (
            millis((delay_ms - spread).max(0.0)),
            millis((delay_ms + spread).min(max_ms)),
        )
    }

    /// Delay for `attempt` at a fixed point `unit` (0.0..=1.0) inside the jitter window.
    pub fn delay_at(&self, attempt: u32, unit: f64) -> Duration {
        let (lo, hi) = self.bounds(attempt);
        let lo_ms = lo.as_millis() as f64;
        let hi_ms = hi.as_millis() as f64;
        millis(lo_ms + (hi_ms - lo_ms) * unit.clamp(0.0, 1.0))
    }

    /// Randomized delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_at(attempt, rand::random::<f64>())
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// Compute where a job that just produced `outcome` goes next.
    ///
    /// `backoff` overrides the policy delay for error retries (worker-level backoff).
    pub fn resolve(
        &self,
        job: &Job,
        outcome: &Outcome,
        backoff: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Transition {
        match outcome {
            Outcome::Success => Transition::Complete,
            Outcome::Error(_) => self.resolve_failure(job, backoff, now),
            Outcome::Snooze(delay) => Transition::Snooze {
                at: now + chrono_duration(*delay),
            },
            Outcome::Cancel(_) => Transition::Cancel,
            Outcome::Discard(_) => Transition::Discard,
        }
    }

    /// Transition for a failed attempt: retry with backoff or discard when exhausted.
    pub fn resolve_failure(
        &self,
        job: &Job,
        backoff: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.should_retry(job.attempt, job.max_attempts) {
            let delay = backoff.unwrap_or_else(|| self.delay_for_attempt(job.attempt));
            Transition::Retry {
                at: now + chrono_duration(delay),
            }
        } else {
            Transition::Discard
        }
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_millis(ms.round() as u64)
}

const MAX_OFFSET_DAYS: i64 = 36_500;

/// Convert a std duration into a chrono one, capped at a century so that
/// adding it to a timestamp can never overflow.
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(MAX_OFFSET_DAYS);
    chrono::Duration::from_std(d).map_or(cap, |d| d.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            strategy,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = no_jitter(BackoffStrategy::Exponential);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = no_jitter(BackoffStrategy::Linear);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_window_is_symmetric_below_the_cap() {
        let policy = no_jitter(BackoffStrategy::Exponential).with_jitter(0.5);
        let (lo, hi) = policy.bounds(2);
        assert_eq!(lo, Duration::from_millis(100));
        assert_eq!(hi, Duration::from_millis(300));
        assert_eq!(policy.delay_at(2, 0.5), Duration::from_millis(200));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0, 3));
        assert!(policy.should_retry(2, 3));
        assert!(!policy.should_retry(3, 3));
        assert!(!policy.should_retry(4, 3));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Backoff never exceeds the cap and its jitter window only moves up with the attempt.
        #[test]
        fn backoff_is_monotonic_within_jitter_and_capped(
            base_ms in 1u64..60_000,
            max_secs in 1u64..7_200,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..1.0,
            attempt in 1u32..64,
            unit in 0.0f64..=1.0,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                multiplier,
                max_delay: Duration::from_secs(max_secs),
                strategy: BackoffStrategy::Exponential,
                jitter,
            };

            let (lo, hi) = policy.bounds(attempt);
            let (next_lo, next_hi) = policy.bounds(attempt + 1);
            prop_assert!(lo <= next_lo);
            prop_assert!(hi <= next_hi);
            prop_assert!(hi <= policy.max_delay);

            let delay = policy.delay_at(attempt, unit);
            prop_assert!(delay >= lo && delay <= hi);
            prop_assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
        }
    }
}
