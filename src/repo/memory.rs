// src/repo/memory.rs

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, trace};

use super::{CandidateFilter, ClaimResult, JobRepository, RepoResult, StatusUpdate, Transition};
use crate::dag::{DependencyGraph, find_cycle};
use crate::errors::RepositoryError;
use crate::job::{ExecutionAttempt, Job, JobFilter, JobId, JobLogEntry};
use crate::types::JobStatus;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    graph: DependencyGraph,
    /// Keys held by jobs that have not failed or been cancelled.
    idempotency: HashMap<String, JobId>,
    attempts: HashMap<JobId, Vec<ExecutionAttempt>>,
    logs: HashMap<JobId, Vec<JobLogEntry>>,
    next_seq: u64,
}

impl State {
    fn job(&self, job_id: JobId) -> RepoResult<&Job> {
        self.jobs.get(&job_id).ok_or(RepositoryError::NotFound(job_id))
    }

    fn job_mut(&mut self, job_id: JobId) -> RepoResult<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(RepositoryError::NotFound(job_id))
    }

    /// Shared checks for new prerequisite edges on `job_id`.
    fn check_new_edges(&self, job_id: JobId, deps: &[JobId]) -> RepoResult<()> {
        if deps.contains(&job_id) {
            return Err(RepositoryError::CycleDetected(vec![job_id, job_id]));
        }
        if let Some(missing) = deps.iter().find(|d| !self.jobs.contains_key(d)) {
            return Err(RepositoryError::UnknownDependency(*missing));
        }
        if let Some(path) = find_cycle(&self.graph, job_id, deps) {
            return Err(RepositoryError::CycleDetected(path));
        }
        Ok(())
    }
}

/// Single-process repository guarded by one mutex.
///
/// Every trait method takes the lock once, so each call is a serializable
/// transaction over the whole store.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    state: Mutex<State>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RepoResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| RepositoryError::Poisoned)
    }
}

impl JobRepository for InMemoryJobRepository {
    fn insert_job(&self, mut job: Job, dependency_ids: &[JobId]) -> RepoResult<JobId> {
        let mut state = self.state()?;

        if state.jobs.contains_key(&job.id) {
            return Err(RepositoryError::DuplicateJobId(job.id));
        }
        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state.idempotency.get(key) {
                return Err(RepositoryError::DuplicateIdempotencyKey(*existing));
            }
        }
        for dep in dependency_ids {
            if !job.dependencies.contains(dep) {
                job.dependencies.push(*dep);
            }
        }
        state.check_new_edges(job.id, &job.dependencies)?;

        state.next_seq += 1;
        job.seq = state.next_seq;
        job.status = JobStatus::Pending;

        let id = job.id;
        state.graph.add_dependencies(id, &job.dependencies);
        if let Some(key) = &job.idempotency_key {
            state.idempotency.insert(key.clone(), id);
        }
        trace!(job_id = %id, seq = job.seq, deps = job.dependencies.len(), "inserted job");
        state.jobs.insert(id, job);
        Ok(id)
    }

    fn add_dependencies(&self, job_id: JobId, dependency_ids: &[JobId]) -> RepoResult<Transition> {
        let mut state = self.state()?;

        let from = state.job(job_id)?.status;
        if !matches!(from, JobStatus::Pending | JobStatus::Ready) {
            return Err(RepositoryError::StateConflict {
                job_id,
                expected: JobStatus::Pending,
                actual: from,
            });
        }
        state.check_new_edges(job_id, dependency_ids)?;

        let unmet = dependency_ids.iter().any(|d| {
            state
                .jobs
                .get(d)
                .is_some_and(|j| j.status != JobStatus::Succeeded)
        });

        state.graph.add_dependencies(job_id, dependency_ids);
        let job = state.job_mut(job_id)?;
        for dep in dependency_ids {
            if !job.dependencies.contains(dep) {
                job.dependencies.push(*dep);
            }
        }
        if unmet && job.status == JobStatus::Ready {
            debug!(job_id = %job_id, "new unmet prerequisite, back to pending");
            job.status = JobStatus::Pending;
        }
        job.updated_at = Utc::now();
        Ok(Transition {
            from,
            job: job.clone(),
        })
    }

    fn get_job(&self, job_id: JobId) -> RepoResult<Option<Job>> {
        Ok(self.state()?.jobs.get(&job_id).cloned())
    }

    fn atomic_claim(
        &self,
        job_id: JobId,
        expected_status: JobStatus,
        expected_attempts: u32,
    ) -> RepoResult<ClaimResult> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;

        if job.status != expected_status
            || job.attempt_count != expected_attempts
            || !job.status.can_transition_to(JobStatus::Running)
        {
            return Ok(ClaimResult::AlreadyClaimed);
        }

        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        Ok(ClaimResult::Claimed(job.clone()))
    }

    fn begin_attempt(&self, job_id: JobId) -> RepoResult<u32> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Running {
            return Err(RepositoryError::StateConflict {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        job.attempt_count += 1;
        job.updated_at = Utc::now();
        Ok(job.attempt_count)
    }

    fn update_status(&self, job_id: JobId, update: StatusUpdate) -> RepoResult<Transition> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        let from = job.status;

        if let Some(expected) = update.expected {
            if from != expected {
                return Err(RepositoryError::StateConflict {
                    job_id,
                    expected,
                    actual: from,
                });
            }
        }

        let mut to = update.status;
        if from == JobStatus::Running && job.cancel_requested {
            to = JobStatus::Cancelled;
        }
        if !from.can_transition_to(to) {
            return Err(RepositoryError::IllegalTransition { job_id, from, to });
        }

        let now = Utc::now();
        job.status = to;
        job.updated_at = now;
        if let Some(at) = update.next_eligible_at {
            job.next_eligible_at = at;
        }
        if let Some(err) = update.last_error {
            job.last_error = Some(err);
        }
        if to != JobStatus::Running {
            job.cancel_requested = false;
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }

        let released_key = match to {
            JobStatus::Failed | JobStatus::Cancelled => job.idempotency_key.clone(),
            _ => None,
        };
        let job = job.clone();

        if let Some(key) = released_key {
            if state.idempotency.get(&key) == Some(&job_id) {
                state.idempotency.remove(&key);
                trace!(job_id = %job_id, key = %key, "idempotency key released");
            }
        }

        Ok(Transition { from, job })
    }

    fn request_cancel(&self, job_id: JobId) -> RepoResult<Job> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Running {
            return Err(RepositoryError::StateConflict {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn list_ready_candidates(&self, filter: &CandidateFilter) -> RepoResult<Vec<Job>> {
        let state = self.state()?;
        let mut out: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Ready))
            .filter(|j| filter.eligible_at.is_none_or(|now| j.is_eligible_at(now)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.admission_cmp(b));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn list_jobs(&self, filter: &JobFilter) -> RepoResult<Vec<Job>> {
        let state = self.state()?;
        let mut out: Vec<&Job> = state.jobs.values().filter(|j| filter.matches(j)).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        Ok(out
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    fn dependency_statuses(&self, job_id: JobId) -> RepoResult<Vec<(JobId, Option<JobStatus>)>> {
        let state = self.state()?;
        let job = state.job(job_id)?;
        Ok(job
            .dependencies
            .iter()
            .map(|d| (*d, state.jobs.get(d).map(|j| j.status)))
            .collect())
    }

    fn dependents_of(&self, job_id: JobId) -> RepoResult<Vec<JobId>> {
        let state = self.state()?;
        state.job(job_id)?;
        Ok(state.graph.dependents_of(job_id))
    }

    fn append_attempt(&self, attempt: ExecutionAttempt) -> RepoResult<()> {
        let mut state = self.state()?;
        state.job(attempt.job_id)?;
        let list = state.attempts.entry(attempt.job_id).or_default();
        if list
            .iter()
            .any(|a| a.attempt_number == attempt.attempt_number)
        {
            return Err(RepositoryError::DuplicateAttempt {
                job_id: attempt.job_id,
                attempt: attempt.attempt_number,
            });
        }
        list.push(attempt);
        Ok(())
    }

    fn attempts(&self, job_id: JobId) -> RepoResult<Vec<ExecutionAttempt>> {
        let state = self.state()?;
        state.job(job_id)?;
        Ok(state.attempts.get(&job_id).cloned().unwrap_or_default())
    }

    fn append_log(&self, entry: JobLogEntry) -> RepoResult<()> {
        let mut state = self.state()?;
        state.job(entry.job_id)?;
        state.logs.entry(entry.job_id).or_default().push(entry);
        Ok(())
    }

    fn logs(&self, job_id: JobId) -> RepoResult<Vec<JobLogEntry>> {
        let state = self.state()?;
        state.job(job_id)?;
        Ok(state.logs.get(&job_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::job::{JobSpec, RetryPolicy};
    use crate::types::Priority;

    fn job(job_type: &str) -> Job {
        Job::from_spec(
            JobSpec::new(job_type),
            &RetryPolicy::default(),
            Duration::from_secs(30),
            Utc::now(),
        )
    }

    fn keyed(key: &str) -> Job {
        let mut spec = JobSpec::new("email");
        spec.idempotency_key = Some(key.to_string());
        Job::from_spec(spec, &RetryPolicy::default(), Duration::from_secs(30), Utc::now())
    }

    fn ready(repo: &InMemoryJobRepository, j: Job) -> JobId {
        let id = repo.insert_job(j, &[]).unwrap();
        repo.update_status(id, StatusUpdate::to(JobStatus::Ready))
            .unwrap();
        id
    }

    #[test]
    fn insert_rejects_unknown_dependency_without_writing() {
        let repo = InMemoryJobRepository::new();
        let ghost = JobId::new();
        let j = job("a");
        let id = j.id;
        let err = repo.insert_job(j, &[ghost]).unwrap_err();
        assert_eq!(err, RepositoryError::UnknownDependency(ghost));
        assert_eq!(repo.get_job(id).unwrap(), None);
    }

    #[test]
    fn self_dependency_is_reported_as_cycle() {
        let repo = InMemoryJobRepository::new();
        let j = job("a");
        let id = j.id;
        let err = repo.insert_job(j, &[id]).unwrap_err();
        assert_eq!(err, RepositoryError::CycleDetected(vec![id, id]));
    }

    #[test]
    fn add_dependencies_rejects_cycles_and_leaves_graph_untouched() {
        let repo = InMemoryJobRepository::new();
        let a = repo.insert_job(job("a"), &[]).unwrap();
        let b = repo.insert_job(job("b"), &[a]).unwrap();
        let c = repo.insert_job(job("c"), &[b]).unwrap();

        let err = repo.add_dependencies(a, &[c]).unwrap_err();
        assert_eq!(err, RepositoryError::CycleDetected(vec![a, c, b, a]));
        assert!(repo.get_job(a).unwrap().unwrap().dependencies.is_empty());
        assert!(repo.dependents_of(c).unwrap().is_empty());
    }

    #[test]
    fn add_dependencies_demotes_ready_job_with_unmet_prerequisite() {
        let repo = InMemoryJobRepository::new();
        let a = repo.insert_job(job("a"), &[]).unwrap();
        let b = ready(&repo, job("b"));

        let t = repo.add_dependencies(b, &[a]).unwrap();
        assert_eq!(t.from, JobStatus::Ready);
        let updated = t.job;
        assert_eq!(updated.status, JobStatus::Pending);
        assert_eq!(updated.dependencies, vec![a]);
        assert_eq!(repo.dependents_of(a).unwrap(), vec![b]);
    }

    #[test]
    fn idempotency_key_is_held_until_failure_or_cancel() {
        let repo = InMemoryJobRepository::new();
        let first = repo.insert_job(keyed("k1"), &[]).unwrap();

        let err = repo.insert_job(keyed("k1"), &[]).unwrap_err();
        assert_eq!(err, RepositoryError::DuplicateIdempotencyKey(first));

        repo.update_status(first, StatusUpdate::to(JobStatus::Cancelled))
            .unwrap();
        let second = repo.insert_job(keyed("k1"), &[]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn claim_is_exclusive_across_threads() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let id = ready(&repo, job("a"));
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    if let ClaimResult::Claimed(_) =
                        repo.atomic_claim(id, JobStatus::Ready, 0).unwrap()
                    {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(repo.get_job(id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn stale_attempt_count_loses_the_claim() {
        let repo = InMemoryJobRepository::new();
        let id = ready(&repo, job("a"));
        assert_eq!(
            repo.atomic_claim(id, JobStatus::Ready, 3).unwrap(),
            ClaimResult::AlreadyClaimed
        );
    }

    #[test]
    fn pending_jobs_cannot_be_claimed() {
        let repo = InMemoryJobRepository::new();
        let id = repo.insert_job(job("a"), &[]).unwrap();
        assert_eq!(
            repo.atomic_claim(id, JobStatus::Pending, 0).unwrap(),
            ClaimResult::AlreadyClaimed
        );
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let repo = InMemoryJobRepository::new();
        let id = repo.insert_job(job("a"), &[]).unwrap();
        let err = repo
            .update_status(id, StatusUpdate::to(JobStatus::Succeeded))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition { .. }));
    }

    #[test]
    fn conditional_update_detects_conflict() {
        let repo = InMemoryJobRepository::new();
        let id = repo.insert_job(job("a"), &[]).unwrap();
        let err = repo
            .update_status(
                id,
                StatusUpdate::to(JobStatus::Cancelled).expecting(JobStatus::Ready),
            )
            .unwrap_err();
        assert_eq!(
            err,
            RepositoryError::StateConflict {
                job_id: id,
                expected: JobStatus::Ready,
                actual: JobStatus::Pending,
            }
        );
    }

    #[test]
    fn cancel_request_overrides_retry_transition() {
        let repo = InMemoryJobRepository::new();
        let id = ready(&repo, job("a"));
        repo.atomic_claim(id, JobStatus::Ready, 0).unwrap();
        repo.begin_attempt(id).unwrap();
        repo.request_cancel(id).unwrap();

        let t = repo
            .update_status(id, StatusUpdate::to(JobStatus::Pending).error("boom"))
            .unwrap();
        assert_eq!(t.from, JobStatus::Running);
        assert_eq!(t.job.status, JobStatus::Cancelled);
        assert!(t.job.completed_at.is_some());
        assert!(!t.job.cancel_requested);
    }

    #[test]
    fn candidates_follow_admission_order_and_eligibility() {
        let repo = InMemoryJobRepository::new();
        let mut low = job("low");
        low.priority = Priority::Low;
        let mut crit = job("crit");
        crit.priority = Priority::Critical;
        let mut later = job("later");
        later.priority = Priority::Critical;
        later.next_eligible_at = Utc::now() + chrono::Duration::hours(1);

        let low = repo.insert_job(low, &[]).unwrap();
        let crit = repo.insert_job(crit, &[]).unwrap();
        let later = repo.insert_job(later, &[]).unwrap();

        let now = repo
            .list_ready_candidates(&CandidateFilter::eligible_at(Utc::now()))
            .unwrap();
        let ids: Vec<JobId> = now.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![crit, low]);

        let all = repo
            .list_ready_candidates(&CandidateFilter::all_queued().with_limit(2))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|j| j.priority == Priority::Critical));
        assert!(all.iter().any(|j| j.id == later));
    }

    #[test]
    fn attempts_are_unique_per_number() {
        let repo = InMemoryJobRepository::new();
        let id = repo.insert_job(job("a"), &[]).unwrap();
        let attempt = ExecutionAttempt {
            job_id: id,
            attempt_number: 1,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            outcome: crate::types::AttemptOutcome::Failed,
            error_detail: Some("boom".into()),
        };
        repo.append_attempt(attempt.clone()).unwrap();
        assert_eq!(
            repo.append_attempt(attempt).unwrap_err(),
            RepositoryError::DuplicateAttempt {
                job_id: id,
                attempt: 1
            }
        );
        assert_eq!(repo.attempts(id).unwrap().len(), 1);
    }

    #[test]
    fn list_jobs_pages_in_submission_order() {
        let repo = InMemoryJobRepository::new();
        let ids: Vec<JobId> = (0..5)
            .map(|i| repo.insert_job(job(&format!("t{i}")), &[]).unwrap())
            .collect();

        let page = repo
            .list_jobs(&JobFilter {
                offset: 1,
                limit: 2,
                ..JobFilter::default()
            })
            .unwrap();
        let got: Vec<JobId> = page.iter().map(|j| j.id).collect();
        assert_eq!(got, ids[1..3].to_vec());

        let typed = repo
            .list_jobs(&JobFilter {
                job_type: Some("t4".into()),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(typed.len(), 1);
    }
}
