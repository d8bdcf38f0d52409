//! Bounded retry for one-shot mutations.
//!
//! Mutations that are not followed by a wait (or whose issue step itself may
//! hit a transient failure) are wrapped here. Only outcomes the classifier
//! marks retryable are retried; everything else returns on the first
//! failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::classify::{ApiError, Classifier};
use crate::error::{ReconcileError, Subject};

/// Backoff settings for retried mutations.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Issue the call exactly once.
    pub fn once() -> Self {
        Self::with_max_attempts(1)
    }
}

/// Issue `mutate` until it succeeds, fails with a non-retryable outcome,
/// or `max_attempts` is used up.
///
/// Delays grow exponentially with 0.5x-1.5x jitter so concurrent callers
/// hitting the same conflict do not retry in lockstep.
pub async fn retry_mutation<F, Fut, T>(
    config: &RetryConfig,
    classifier: &Classifier,
    subject: &Subject,
    mut mutate: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match mutate().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let outcome = classifier.classify(&err);
        if !outcome.is_retryable() {
            return Err(subject.remote(outcome, err));
        }
        if attempt >= max_attempts {
            error!(
                "{} failed after {} attempts ({}): {}",
                subject, attempt, outcome, err
            );
            return Err(subject.remote(outcome, err));
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64((delay.as_secs_f64() * jitter).max(0.0));

        warn!(
            "{} failed ({}), retrying in {}ms (attempt {}/{}): {}",
            subject,
            outcome,
            jittered.as_millis(),
            attempt,
            max_attempts,
            err
        );

        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier)
                .min(config.max_delay.as_secs_f64())
                .max(0.0),
        );
    }
}
