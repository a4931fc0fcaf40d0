// src/repo/mod.rs

//! Persistence boundary.
//!
//! The engine never mutates job records directly; every change goes through
//! a [`JobRepository`]. Implementations must make each method atomic with
//! respect to the others (a transaction, a row lock, or a single mutex as in
//! [`memory::InMemoryJobRepository`]).

use std::fmt::Debug;

use chrono::{DateTime, Utc};

use crate::errors::RepositoryError;
use crate::job::{ExecutionAttempt, Job, JobFilter, JobId, JobLogEntry};
use crate::types::JobStatus;

pub mod memory;

pub use memory::InMemoryJobRepository;

pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Result of [`JobRepository::atomic_claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// The caller now owns the job; it is `running`.
    Claimed(Job),
    /// Someone else moved the job first.
    AlreadyClaimed,
}

/// A conditional status write.
///
/// Only the fields set to `Some` are written. When `expected` is set the
/// write fails with [`RepositoryError::StateConflict`] unless the job is
/// still in that state.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub expected: Option<JobStatus>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            expected: None,
            next_eligible_at: None,
            last_error: None,
        }
    }

    pub fn expecting(mut self, status: JobStatus) -> Self {
        self.expected = Some(status);
        self
    }

    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_eligible_at = Some(at);
        self
    }

    pub fn error(mut self, detail: impl Into<String>) -> Self {
        self.last_error = Some(detail.into());
        self
    }
}

/// What an applied [`StatusUpdate`] actually did.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobStatus,
    /// The job after the write. `job.status` may differ from the requested
    /// status, see [`JobRepository::update_status`].
    pub job: Job,
}

/// Which jobs [`JobRepository::list_ready_candidates`] returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateFilter {
    /// Skip jobs whose `next_eligible_at` is later than this. `None` keeps
    /// every `pending`/`ready` job.
    pub eligible_at: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl CandidateFilter {
    pub fn eligible_at(now: DateTime<Utc>) -> Self {
        Self {
            eligible_at: Some(now),
            limit: None,
        }
    }

    /// Every queued job regardless of retry delay.
    pub fn all_queued() -> Self {
        Self {
            eligible_at: None,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage for jobs, dependency edges, attempts and status history.
pub trait JobRepository: Send + Sync + Debug {
    /// Persist a new `pending` job together with its prerequisite edges.
    ///
    /// Checks, in one atomic step: every dependency exists, the idempotency
    /// key is not held by a live job, and the new edges do not close a cycle.
    /// Nothing is written when any check fails. Assigns `job.seq`.
    fn insert_job(&self, job: Job, dependency_ids: &[JobId]) -> RepoResult<JobId>;

    /// Add prerequisite edges to an existing `pending`/`ready` job, with the
    /// same atomic validation as [`insert_job`](Self::insert_job). A `ready`
    /// job drops back to `pending` when a new prerequisite has not succeeded;
    /// the returned [`Transition`] carries the status before the write.
    fn add_dependencies(&self, job_id: JobId, dependency_ids: &[JobId]) -> RepoResult<Transition>;

    fn get_job(&self, job_id: JobId) -> RepoResult<Option<Job>>;

    /// Move a job from `expected_status` to `running`, provided its
    /// `attempt_count` is still `expected_attempts`. Exactly one concurrent
    /// caller can win for a given job and state.
    fn atomic_claim(
        &self,
        job_id: JobId,
        expected_status: JobStatus,
        expected_attempts: u32,
    ) -> RepoResult<ClaimResult>;

    /// Increment `attempt_count` on a `running` job and return the new
    /// attempt number.
    fn begin_attempt(&self, job_id: JobId) -> RepoResult<u32>;

    /// Apply a state-machine transition.
    ///
    /// Illegal transitions are rejected. If a cancel was requested while the
    /// job was running, any update that moves it out of `running` lands it
    /// in `cancelled` instead. Leaving `running` for a
    /// terminal state stamps `completed_at`; entering `failed` or `cancelled`
    /// frees the idempotency key.
    fn update_status(&self, job_id: JobId, update: StatusUpdate) -> RepoResult<Transition>;

    /// Flag a `running` job for cooperative cancellation.
    fn request_cancel(&self, job_id: JobId) -> RepoResult<Job>;

    /// `pending`/`ready` jobs in admission order (priority desc, created_at
    /// asc). Finite per call; callers simply ask again on the next poll.
    fn list_ready_candidates(&self, filter: &CandidateFilter) -> RepoResult<Vec<Job>>;

    /// Jobs matching `filter`, oldest first.
    fn list_jobs(&self, filter: &JobFilter) -> RepoResult<Vec<Job>>;

    /// Status of each direct prerequisite of `job_id`.
    fn dependency_statuses(&self, job_id: JobId) -> RepoResult<Vec<(JobId, Option<JobStatus>)>>;

    /// Jobs that list `job_id` as a direct prerequisite.
    fn dependents_of(&self, job_id: JobId) -> RepoResult<Vec<JobId>>;

    /// Append one attempt record; `(job_id, attempt_number)` is unique.
    fn append_attempt(&self, attempt: ExecutionAttempt) -> RepoResult<()>;

    fn attempts(&self, job_id: JobId) -> RepoResult<Vec<ExecutionAttempt>>;

    fn append_log(&self, entry: JobLogEntry) -> RepoResult<()>;

    fn logs(&self, job_id: JobId) -> RepoResult<Vec<JobLogEntry>>;
}
