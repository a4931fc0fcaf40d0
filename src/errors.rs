// src/errors.rs

//! Crate-wide error types.
//!
//! - [`JobdagError`] is what the public API and the binary surface.
//! - [`ValidationError`] is everything `submit` can reject synchronously.
//! - [`RepositoryError`] is returned by [`JobRepository`](crate::repo::JobRepository)
//!   implementations.
//! - [`ExecutionError`] is attempt-scoped and only ever feeds the retry
//!   controller; it is never returned to a client.

use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;
use crate::types::JobStatus;

#[derive(Error, Debug)]
pub enum JobdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job spec: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job {job_id} is {status}; operation not allowed")]
    InvalidState { job_id: JobId, status: JobStatus },

    #[error("Cycle detected in job file: {0}")]
    DagCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Rejections surfaced to the submitter. Nothing is persisted when one of
/// these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("malformed job spec: {0}")]
    Malformed(String),

    #[error("unknown dependency {0}")]
    UnknownDependency(JobId),

    #[error("idempotency key already used by job {existing}")]
    DuplicateIdempotencyKey { existing: JobId },

    #[error("dependency cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<JobId> },

    #[error("resource request exceeds budget: {0}")]
    ExceedsBudget(String),
}

fn format_path(path: &[JobId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job id {0} already exists")]
    DuplicateJobId(JobId),

    #[error("unknown dependency {0}")]
    UnknownDependency(JobId),

    #[error("idempotency key already used by job {0}")]
    DuplicateIdempotencyKey(JobId),

    #[error("dependency cycle detected through {}", format_path(.0))]
    CycleDetected(Vec<JobId>),

    /// A conditional write found the job in a different state.
    #[error("job {job_id} is {actual}, expected {expected}")]
    StateConflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("attempt {attempt} already recorded for job {job_id}")]
    DuplicateAttempt { job_id: JobId, attempt: u32 },

    #[error("repository lock poisoned")]
    Poisoned,
}

impl From<RepositoryError> for ValidationError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::UnknownDependency(id) => ValidationError::UnknownDependency(id),
            RepositoryError::DuplicateIdempotencyKey(existing) => {
                ValidationError::DuplicateIdempotencyKey { existing }
            }
            RepositoryError::CycleDetected(path) => ValidationError::CycleDetected { path },
            other => ValidationError::Malformed(other.to_string()),
        }
    }
}

/// Why a single execution attempt did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted by shutdown")]
    Interrupted,
}

impl ExecutionError {
    pub fn failed(detail: impl Into<String>) -> Self {
        ExecutionError::Failed(detail.into())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, JobdagError>;
