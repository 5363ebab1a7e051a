//! Retry policy and dead letter handling for federation jobs.
//!
//! Failed jobs are pushed back with an exponential delay ([`ap_backoff`])
//! until the policy's attempt ceiling is hit, after which they are dropped
//! with a [`DeadLetterEntry`] logged at `warn`.

use std::time::Duration;

use apkernel_federation::jobs::{DeleteAccountJob, DeliveryJob, InboxJob};
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::warn;

/// Upper bound of the base delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(8 * 60 * 60);

/// Base unit of the backoff.
const BACKOFF_UNIT_MS: u64 = 60 * 1000;

/// Share of the base delay added as jitter.
const JITTER_RATIO: f64 = 0.2;

/// Delay before the next attempt after `attempts` failures.
#[must_use]
pub fn ap_backoff(attempts: u32) -> Duration {
    ap_backoff_with_jitter(attempts, rand::thread_rng().r#gen::<f64>())
}

/// [`ap_backoff`] with a fixed jitter sample in `[0, 1)`.
///
/// `base = min((2^attempts - 1) * 60s, 8h)`, then `round(base * jitter * 0.2)`
/// is added on top. Jitter only ever lengthens the delay.
#[must_use]
pub fn ap_backoff_with_jitter(attempts: u32, jitter: f64) -> Duration {
    let max_ms = MAX_BACKOFF.as_millis() as u64;
    let base_ms = 2_u64
        .checked_pow(attempts)
        .map_or(u64::MAX, |p| p - 1)
        .saturating_mul(BACKOFF_UNIT_MS)
        .min(max_ms);
    let jitter_ms = (base_ms as f64 * jitter.clamp(0.0, 1.0) * JITTER_RATIO).round() as u64;
    Duration::from_millis(base_ms + jitter_ms)
}

/// How many times a job may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Outbound deliveries.
    pub const DELIVER: Self = Self { max_attempts: 12 };
    /// Inbound activities.
    pub const INBOX: Self = Self { max_attempts: 8 };

    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Whether a job that has already run `attempts` times may run again.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A job carrying its own attempt counter.
pub trait RetryableJob: Clone + Send + Sync {
    fn job_id(&self) -> &str;

    /// Times the job has failed so far.
    fn attempt_count(&self) -> u32;

    fn set_attempt_count(&mut self, attempts: u32);
}

impl RetryableJob for DeliveryJob {
    fn job_id(&self) -> &str {
        &self.id
    }

    fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn set_attempt_count(&mut self, attempts: u32) {
        self.attempt_count = attempts;
    }
}

impl RetryableJob for InboxJob {
    fn job_id(&self) -> &str {
        &self.id
    }

    fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn set_attempt_count(&mut self, attempts: u32) {
        self.attempt_count = attempts;
    }
}

impl RetryableJob for DeleteAccountJob {
    fn job_id(&self) -> &str {
        &self.id
    }

    fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn set_attempt_count(&mut self, attempts: u32) {
        self.attempt_count = attempts;
    }
}

/// Dead letter queue entry for failed jobs.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry<T> {
    /// The failed job.
    pub job: T,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl<T> DeadLetterEntry<T> {
    pub fn new(job: T, attempts: u32, error: String) -> Self {
        Self {
            job,
            attempts,
            last_error: error,
            failed_at: Utc::now(),
        }
    }
}

/// What to do with a job that just failed.
#[derive(Debug, Clone)]
pub enum RetryDecision<T> {
    /// Push `job` back to run after `delay`.
    Retry { job: T, delay: Duration },
    /// Out of attempts.
    GiveUp(DeadLetterEntry<T>),
}

/// Applies a [`RetryPolicy`] to failed jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryDriver {
    queue: &'static str,
    policy: RetryPolicy,
}

impl RetryDriver {
    #[must_use]
    pub const fn new(queue: &'static str, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Bump the attempt counter of `job` and decide whether it runs again.
    pub fn on_failure<T: RetryableJob>(&self, mut job: T, error: &str) -> RetryDecision<T> {
        let attempts = job.attempt_count() + 1;
        job.set_attempt_count(attempts);

        if self.policy.should_retry(attempts) {
            let delay = ap_backoff(attempts);
            return RetryDecision::Retry { job, delay };
        }

        warn!(
            queue = self.queue,
            job_id = %job.job_id(),
            attempts,
            error = %error,
            "Giving up on job"
        );
        RetryDecision::GiveUp(DeadLetterEntry::new(job, attempts, error.to_string()))
    }
}
