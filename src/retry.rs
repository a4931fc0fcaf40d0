// src/retry.rs

//! Failure state machine: decide between another attempt and permanent
//! failure, and compute when the next attempt may start.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::ExecutionError;
use crate::job::{Job, RetryPolicy};

/// Delay before the attempt that follows failed attempt number `attempt`.
///
/// `min(base_delay * backoff_multiplier^(attempt - 1), max_delay)`, rounded
/// to whole milliseconds; attempt 0 is treated as 1.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let raw_ms = (policy.base_delay.as_millis() as f64
        * policy.backoff_multiplier.powi(exponent))
    .round();

    if !raw_ms.is_finite() || raw_ms >= policy.max_delay.as_millis() as f64 {
        policy.max_delay
    } else {
        Duration::from_millis(raw_ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Requeue as `pending`, not eligible before `next_eligible_at`.
    Retry {
        delay: Duration,
        next_eligible_at: DateTime<Utc>,
    },
    /// Retries exhausted; the job becomes `failed`.
    PermanentFailure { reason: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController;

impl RetryController {
    pub fn new() -> Self {
        Self
    }

    /// `job.attempt_count` must already include the attempt that failed.
    pub fn on_failure(&self, job: &Job, error: &ExecutionError, now: DateTime<Utc>) -> RetryDecision {
        let policy = &job.retry_policy;

        if job.attempt_count < policy.max_attempts {
            let delay = backoff_delay(job.attempt_count, policy);
            let next_eligible_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            debug!(
                job_id = %job.id,
                attempt = job.attempt_count,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "scheduling retry"
            );
            RetryDecision::Retry {
                delay,
                next_eligible_at,
            }
        } else {
            RetryDecision::PermanentFailure {
                reason: format!(
                    "permanently failed after {} attempts: {error}",
                    job.attempt_count
                ),
            }
        }
    }
}
