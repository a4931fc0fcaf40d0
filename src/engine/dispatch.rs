// src/engine/dispatch.rs

//! One worker's dispatch loop: claim, reserve, execute, report.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::EngineShared;
use super::transitions::{NextStep, attempt_outcome};
use crate::errors::{ExecutionError, RepositoryError};
use crate::exec::{AttemptLimits, ExecutionContext, run_attempt};
use crate::job::{ExecutionAttempt, Job};
use crate::repo::{ClaimResult, RepoResult, StatusUpdate, Transition};
use crate::resources::Reservation;
use crate::types::JobStatus;

pub struct DispatchLoop {
    worker: usize,
    shared: Arc<EngineShared>,
    /// Stop claiming new work.
    shutdown: CancellationToken,
    /// Abandon in-flight attempts.
    interrupt: CancellationToken,
}

impl DispatchLoop {
    pub(crate) fn new(
        worker: usize,
        shared: Arc<EngineShared>,
        shutdown: CancellationToken,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            worker,
            shared,
            shutdown,
            interrupt,
        }
    }

    /// Main loop.
    ///
    /// - Runs admission cycles until nothing is dispatchable.
    /// - Then sleeps until woken (new submission, finished job, cancel) or
    ///   until the poll interval elapses, whichever is first.
    /// - Returns once shutdown is requested and the current attempt, if any,
    ///   has been reported.
    pub async fn run(self) {
        info!(worker = self.worker, "dispatch loop started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Registered before the cycle so a wake-up during it is not lost.
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let dispatched = match self.cycle().await {
                Ok(dispatched) => dispatched,
                Err(err) => {
                    error!(worker = self.worker, error = %err, "dispatch cycle failed");
                    false
                }
            };
            if dispatched {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut notified => trace!(worker = self.worker, "woken"),
                _ = tokio::time::sleep(self.shared.settings.poll_interval) => {}
            }
        }

        info!(worker = self.worker, "dispatch loop stopped");
    }

    /// One admission cycle. Returns whether an attempt was executed.
    async fn cycle(&self) -> RepoResult<bool> {
        let now = Utc::now();
        let admission = &self.shared.admission;
        admission.promote_eligible(now)?;

        for candidate in admission.next_candidates(now, self.shared.settings.batch_size)? {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }

            let job = match self.shared.repo.atomic_claim(
                candidate.id,
                JobStatus::Ready,
                candidate.attempt_count,
            )? {
                ClaimResult::Claimed(job) => job,
                ClaimResult::AlreadyClaimed => {
                    trace!(worker = self.worker, job_id = %candidate.id, "claim lost");
                    continue;
                }
            };

            match self
                .shared
                .allocator
                .try_reserve(job.id, &job.job_type, job.resources)
            {
                Ok(reservation) => {
                    self.execute(job, reservation).await?;
                    return Ok(true);
                }
                Err(denied) => {
                    debug!(worker = self.worker, %denied, "reservation denied; job stays ready");
                    self.unclaim(&job)?;
                }
            }
        }

        Ok(false)
    }

    /// Put a claimed job back to `ready` after a resource denial. The claim
    /// never became visible, so nothing is recorded unless a cancel arrived in
    /// between.
    fn unclaim(&self, job: &Job) -> RepoResult<()> {
        let update = StatusUpdate::to(JobStatus::Ready).expecting(JobStatus::Running);
        let t = self.shared.repo.update_status(job.id, update)?;
        if t.job.status == JobStatus::Cancelled {
            // Observers last saw the job `ready`.
            let seen = Transition {
                from: JobStatus::Ready,
                ..t
            };
            self.shared.lifecycle.record_applied(&seen, "cancelled by user")?;
            self.shared.wakeup.notify_waiters();
        }
        Ok(())
    }

    async fn execute(&self, mut job: Job, reservation: Reservation) -> RepoResult<()> {
        let shared = &self.shared;
        let attempt = shared.repo.begin_attempt(job.id)?;
        job.attempt_count = attempt;
        shared.lifecycle.started(&job, attempt)?;

        let cancel = shared.register_inflight(job.id);
        // A cancel may have landed between the claim and the registration.
        if shared
            .repo
            .get_job(job.id)?
            .is_some_and(|j| j.cancel_requested)
        {
            cancel.cancel();
        }

        let ctx = ExecutionContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt,
            payload: job.payload.clone(),
            cancel,
        };
        let limits = AttemptLimits {
            timeout: job.timeout,
            cancel_grace: shared.settings.cancel_grace,
        };

        let started_at = Utc::now();
        let result = match shared.registry.resolve(&job.job_type) {
            Some(handler) => run_attempt(handler, ctx, limits, &self.interrupt).await,
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
                Err(ExecutionError::failed(format!(
                    "no handler registered for job type '{}'",
                    job.job_type
                )))
            }
        };
        let ended_at = Utc::now();

        shared.unregister_inflight(job.id);
        reservation.release();

        shared.repo.append_attempt(ExecutionAttempt {
            job_id: job.id,
            attempt_number: attempt,
            started_at,
            ended_at,
            outcome: attempt_outcome(&result),
            error_detail: result.as_ref().err().map(|e| e.to_string()),
        })?;

        let step = NextStep::plan(&job, &result, &shared.retry, ended_at);
        let transition = match shared
            .lifecycle
            .apply(job.id, step.status_update(), step.message(attempt))
        {
            Ok(t) => t,
            Err(RepositoryError::StateConflict { actual, .. }) => {
                warn!(job_id = %job.id, %actual, "job left running while executing; result dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if transition.job.status == JobStatus::Succeeded {
            shared.admission.promote_dependents(job.id, Utc::now())?;
        }
        shared.wakeup.notify_waiters();
        Ok(())
    }
}
