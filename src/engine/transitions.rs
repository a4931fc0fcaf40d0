// src/engine/transitions.rs

//! Pure mapping from an attempt result to the job's next state.
//!
//! No IO here: the dispatch loop feeds in the finished attempt and applies
//! the returned [`NextStep`] through the lifecycle.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::ExecutionError;
use crate::job::Job;
use crate::repo::StatusUpdate;
use crate::retry::{RetryController, RetryDecision};
use crate::types::{AttemptOutcome, JobStatus};

pub fn attempt_outcome(result: &Result<(), ExecutionError>) -> AttemptOutcome {
    match result {
        Ok(()) => AttemptOutcome::Succeeded,
        Err(ExecutionError::Failed(_)) => AttemptOutcome::Failed,
        Err(ExecutionError::Timeout(_)) => AttemptOutcome::Timeout,
        Err(ExecutionError::Cancelled) => AttemptOutcome::Cancelled,
        Err(ExecutionError::Interrupted) => AttemptOutcome::Interrupted,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    Succeed,
    Retry {
        delay: Duration,
        next_eligible_at: DateTime<Utc>,
        error: String,
    },
    Fail {
        reason: String,
    },
    Cancel,
}

impl NextStep {
    /// Decide what follows the attempt `job.attempt_count`.
    ///
    /// Timeouts and shutdown interrupts go through the retry controller like
    /// any other execution error.
    pub fn plan(
        job: &Job,
        result: &Result<(), ExecutionError>,
        retry: &RetryController,
        now: DateTime<Utc>,
    ) -> Self {
        match result {
            Ok(()) => NextStep::Succeed,
            Err(ExecutionError::Cancelled) => NextStep::Cancel,
            Err(err) => match retry.on_failure(job, err, now) {
                RetryDecision::Retry {
                    delay,
                    next_eligible_at,
                } => NextStep::Retry {
                    delay,
                    next_eligible_at,
                    error: err.to_string(),
                },
                RetryDecision::PermanentFailure { reason } => NextStep::Fail { reason },
            },
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            NextStep::Succeed => JobStatus::Succeeded,
            NextStep::Retry { .. } => JobStatus::Pending,
            NextStep::Fail { .. } => JobStatus::Failed,
            NextStep::Cancel => JobStatus::Cancelled,
        }
    }

    /// Conditional write that moves the job out of `running`.
    pub fn status_update(&self) -> StatusUpdate {
        let update = StatusUpdate::to(self.status()).expecting(JobStatus::Running);
        match self {
            NextStep::Retry {
                next_eligible_at,
                error,
                ..
            } => update.eligible_at(*next_eligible_at).error(error.clone()),
            NextStep::Fail { reason } => update.error(reason.clone()),
            NextStep::Succeed | NextStep::Cancel => update,
        }
    }

    /// Job-log line for this step.
    pub fn message(&self, attempt: u32) -> String {
        match self {
            NextStep::Succeed => "completed successfully".to_string(),
            NextStep::Retry { delay, error, .. } => {
                format!("attempt {attempt} failed, retrying in {delay:?}: {error}")
            }
            NextStep::Fail { reason } => reason.clone(),
            NextStep::Cancel => "cancelled by user".to_string(),
        }
    }
}
