// src/engine/lifecycle.rs

use std::sync::Arc;

use tracing::info;

use super::events::{EventPublisher, StatusEvent};
use crate::job::{Job, JobId, JobLogEntry};
use crate::repo::{JobRepository, RepoResult, StatusUpdate, Transition};
use crate::types::JobStatus;

/// Writes a status change, its job-log line and its event together.
///
/// Every transition the engine makes goes through here so that history and
/// subscribers never disagree with the repository.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    repo: Arc<dyn JobRepository>,
    events: EventPublisher,
}

impl Lifecycle {
    pub fn new(repo: Arc<dyn JobRepository>, events: EventPublisher) -> Self {
        Self { repo, events }
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn created(&self, job: &Job) -> RepoResult<()> {
        self.record(job.id, None, JobStatus::Pending, 0, "job created")
    }

    /// Record an already-applied claim (`ready -> running`).
    pub fn started(&self, job: &Job, attempt: u32) -> RepoResult<()> {
        self.record(
            job.id,
            Some(JobStatus::Ready),
            JobStatus::Running,
            attempt,
            format!("execution started (attempt {attempt})"),
        )
    }

    /// Apply `update` and record whatever state the job actually landed in.
    pub fn apply(
        &self,
        job_id: JobId,
        update: StatusUpdate,
        message: impl Into<String>,
    ) -> RepoResult<Transition> {
        let requested = update.status;
        let transition = self.repo.update_status(job_id, update)?;
        let landed = transition.job.status;

        let message = if landed == JobStatus::Cancelled && requested != JobStatus::Cancelled {
            "cancelled by user".to_string()
        } else {
            message.into()
        };

        self.record(
            job_id,
            Some(transition.from),
            landed,
            transition.job.attempt_count,
            message,
        )?;
        Ok(transition)
    }

    /// Record a transition the repository already applied on its own, such as
    /// a dependency demotion or a cancel override.
    pub fn record_applied(&self, transition: &Transition, message: impl Into<String>) -> RepoResult<()> {
        self.record(
            transition.job.id,
            Some(transition.from),
            transition.job.status,
            transition.job.attempt_count,
            message,
        )
    }

    /// A job-log line without a status change.
    pub fn note(&self, job_id: JobId, status: JobStatus, message: impl Into<String>) -> RepoResult<()> {
        self.repo
            .append_log(JobLogEntry::new(job_id, status, message))
    }

    fn record(
        &self,
        job_id: JobId,
        from: Option<JobStatus>,
        to: JobStatus,
        attempt: u32,
        message: impl Into<String>,
    ) -> RepoResult<()> {
        let message = message.into();
        let entry = JobLogEntry::new(job_id, to, message.clone());
        let at = entry.created_at;
        self.repo.append_log(entry)?;

        match from {
            Some(from) => info!(job_id = %job_id, %from, %to, attempt, "{}", message),
            None => info!(job_id = %job_id, %to, "{}", message),
        }

        self.events.publish(StatusEvent {
            job_id,
            from,
            to,
            attempt,
            at,
            message,
        });
        Ok(())
    }
}
