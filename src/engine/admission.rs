// src/engine/admission.rs

//! Priority admission queue.
//!
//! Not a separate store: an ordered view over the repository's
//! `pending`/`ready` jobs. `pending` jobs are promoted to `ready` lazily,
//! once per dispatch cycle, and eagerly for the dependents of a job that
//! just succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::lifecycle::Lifecycle;
use crate::dag::is_ready;
use crate::errors::RepositoryError;
use crate::job::{Job, JobId};
use crate::repo::{CandidateFilter, JobRepository, RepoResult, StatusUpdate};
use crate::types::JobStatus;

#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    repo: Arc<dyn JobRepository>,
    lifecycle: Lifecycle,
}

impl AdmissionQueue {
    pub fn new(repo: Arc<dyn JobRepository>, lifecycle: Lifecycle) -> Self {
        Self { repo, lifecycle }
    }

    /// Promote one `pending` job if it is eligible and every prerequisite
    /// succeeded. Returns whether this call moved it.
    pub fn try_promote(&self, job_id: JobId, now: DateTime<Utc>) -> RepoResult<bool> {
        let Some(job) = self.repo.get_job(job_id)? else {
            return Err(RepositoryError::NotFound(job_id));
        };
        if job.status != JobStatus::Pending || !job.is_eligible_at(now) {
            return Ok(false);
        }

        let deps = self.repo.dependency_statuses(job_id)?;
        if !is_ready(job_id, deps) {
            return Ok(false);
        }

        let update = StatusUpdate::to(JobStatus::Ready).expecting(JobStatus::Pending);
        let message = if job.attempt_count == 0 {
            "dependencies satisfied"
        } else {
            "retry delay elapsed"
        };
        match self.lifecycle.apply(job_id, update, message) {
            Ok(_) => Ok(true),
            // Cancelled or promoted by someone else in the meantime.
            Err(RepositoryError::StateConflict { .. }) => {
                trace!(job_id = %job_id, "promotion lost a race");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Promote every eligible `pending` job whose prerequisites succeeded.
    pub fn promote_eligible(&self, now: DateTime<Utc>) -> RepoResult<usize> {
        let pending: Vec<JobId> = self
            .repo
            .list_ready_candidates(&CandidateFilter::eligible_at(now))?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();

        let mut promoted = 0;
        for id in pending {
            if self.try_promote(id, now)? {
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(promoted, "admission cycle promoted jobs");
        }
        Ok(promoted)
    }

    /// Re-evaluate the direct dependents of a job that just succeeded.
    pub fn promote_dependents(&self, job_id: JobId, now: DateTime<Utc>) -> RepoResult<usize> {
        let mut promoted = 0;
        for dependent in self.repo.dependents_of(job_id)? {
            if self.try_promote(dependent, now)? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// `ready` jobs eligible at `now`, best first.
    pub fn next_candidates(&self, now: DateTime<Utc>, limit: usize) -> RepoResult<Vec<Job>> {
        let mut ready: Vec<Job> = self
            .repo
            .list_ready_candidates(&CandidateFilter::eligible_at(now))?
            .into_iter()
            .filter(|j| j.status == JobStatus::Ready)
            .collect();
        ready.truncate(limit);
        Ok(ready)
    }

    /// Every queued job in admission order, ignoring retry delays.
    pub fn queued(&self) -> RepoResult<Vec<Job>> {
        self.repo
            .list_ready_candidates(&CandidateFilter::all_queued())
    }
}
