// src/engine/mod.rs

//! Job execution engine.
//!
//! This module ties together:
//! - the repository (persistence boundary)
//! - the admission queue (readiness and ordering)
//! - the resource allocator
//! - the retry controller
//! - the dispatch loops that claim and execute jobs
//!
//! [`Engine`] is the API a transport layer calls. [`Engine::start_workers`]
//! spawns the dispatch loops and returns a [`WorkerPool`] handle for graceful
//! shutdown. The pure outcome planning lives in [`transitions`]; the async
//! shell is [`dispatch`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod admission;
pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod transitions;

pub use admission::AdmissionQueue;
pub use dispatch::DispatchLoop;
pub use events::{EventPublisher, StatusEvent, StatusSubscription, WatchScope};
pub use lifecycle::Lifecycle;

use crate::config::ConfigFile;
use crate::errors::{JobdagError, RepositoryError, Result, ValidationError};
use crate::exec::{HandlerRegistry, JobHandler};
use crate::job::{ExecutionAttempt, Job, JobFilter, JobId, JobLogEntry, JobSnapshot, JobSpec, RetryPolicy};
use crate::repo::{InMemoryJobRepository, JobRepository, StatusUpdate};
use crate::resources::{Budget, ResourceAllocator, ResourceUsage};
use crate::retry::RetryController;
use crate::types::JobStatus;

/// Worker-side knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub workers: usize,
    /// Longest a dispatch loop sleeps when nothing is dispatchable.
    pub poll_interval: Duration,
    /// Attempt timeout for jobs that set none.
    pub default_timeout: Duration,
    pub cancel_grace: Duration,
    /// How long [`WorkerPool::shutdown`] waits for in-flight attempts before
    /// interrupting them.
    pub shutdown_timeout: Duration,
    /// Ready candidates fetched per admission cycle.
    pub batch_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(1000),
            default_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            batch_size: 32,
        }
    }
}

/// Result of [`Engine::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Created(JobId),
    /// The idempotency key already belongs to this live job.
    Existing(JobId),
}

impl Submitted {
    pub fn id(&self) -> JobId {
        match self {
            Submitted::Created(id) | Submitted::Existing(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Submitted::Created(_))
    }
}

/// Result of [`Engine::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was `pending`/`ready` and is now `cancelled`.
    Cancelled,
    /// The job is running; it becomes `cancelled` once the attempt returns
    /// or the grace period runs out.
    Requested,
}

/// State shared by the engine handle and every dispatch loop.
pub(crate) struct EngineShared {
    pub(crate) repo: Arc<dyn JobRepository>,
    pub(crate) allocator: ResourceAllocator,
    pub(crate) registry: HandlerRegistry,
    pub(crate) admission: AdmissionQueue,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) retry: RetryController,
    pub(crate) default_retry: RetryPolicy,
    pub(crate) settings: DispatchSettings,
    pub(crate) wakeup: Notify,
    inflight: Mutex<HashMap<JobId, CancellationToken>>,
}

impl EngineShared {
    fn inflight(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register_inflight(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight().insert(job_id, token.clone());
        token
    }

    pub(crate) fn unregister_inflight(&self, job_id: JobId) {
        self.inflight().remove(&job_id);
    }

    fn signal_cancel(&self, job_id: JobId) -> bool {
        match self.inflight().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    repo: Option<Arc<dyn JobRepository>>,
    budget: Option<Budget>,
    class_budgets: HashMap<String, Budget>,
    registry: HandlerRegistry,
    retry_policy: RetryPolicy,
    settings: DispatchSettings,
    event_capacity: Option<usize>,
}

impl EngineBuilder {
    /// Budget, retry defaults and dispatch settings from a validated config.
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let mut builder = Self::default()
            .budget(cfg.budget())
            .retry_policy(cfg.retry_policy())
            .dispatch(cfg.dispatch_settings());
        for (job_type, budget) in cfg.class_budgets() {
            builder = builder.class_budget(job_type, budget);
        }
        builder
    }

    /// Defaults to an [`InMemoryJobRepository`].
    pub fn repository(mut self, repo: Arc<dyn JobRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn class_budget(mut self, job_type: impl Into<String>, budget: Budget) -> Self {
        self.class_budgets.insert(job_type.into(), budget);
        self
    }

    pub fn handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.registry.register(job_type, handler);
        self
    }

    pub fn fallback_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.registry.set_fallback(handler);
        self
    }

    /// Policy for jobs submitted without one.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn dispatch(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Engine {
        let repo = self
            .repo
            .unwrap_or_else(|| Arc::new(InMemoryJobRepository::new()) as Arc<dyn JobRepository>);
        let budget = self.budget.unwrap_or(Budget::new(u64::MAX, u64::MAX));
        let events = self
            .event_capacity
            .map(EventPublisher::new)
            .unwrap_or_default();
        let lifecycle = Lifecycle::new(Arc::clone(&repo), events);
        let admission = AdmissionQueue::new(Arc::clone(&repo), lifecycle.clone());

        Engine {
            shared: Arc::new(EngineShared {
                repo,
                allocator: ResourceAllocator::with_classes(budget, self.class_budgets),
                registry: self.registry,
                admission,
                lifecycle,
                retry: RetryController::new(),
                default_retry: self.retry_policy,
                settings: self.settings,
                wakeup: Notify::new(),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Cheap to clone; every clone talks to the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.shared.settings)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.shared.settings
    }

    /// Validate and persist a job.
    ///
    /// Nothing is written when validation fails. A live job already holding
    /// the idempotency key is returned as [`Submitted::Existing`].
    pub fn submit(&self, spec: JobSpec) -> Result<Submitted> {
        spec.validate()?;
        if !self
            .shared
            .allocator
            .fits_budget(&spec.job_type, &spec.resources)
        {
            return Err(ValidationError::ExceedsBudget(format!(
                "{} for type '{}' (budget {})",
                spec.resources,
                spec.job_type,
                self.shared.allocator.budget()
            ))
            .into());
        }

        let now = Utc::now();
        let job = Job::from_spec(
            spec,
            &self.shared.default_retry,
            self.shared.settings.default_timeout,
            now,
        );
        let deps = job.dependencies.clone();

        let id = match self.shared.repo.insert_job(job.clone(), &deps) {
            Ok(id) => id,
            Err(RepositoryError::DuplicateIdempotencyKey(existing)) => {
                debug!(job_id = %existing, "duplicate idempotency key; returning existing job");
                return Ok(Submitted::Existing(existing));
            }
            Err(err @ (RepositoryError::Poisoned | RepositoryError::NotFound(_))) => {
                return Err(err.into());
            }
            Err(err) => return Err(ValidationError::from(err).into()),
        };

        self.shared.lifecycle.created(&job)?;
        self.shared.admission.try_promote(id, now)?;
        self.shared.wakeup.notify_waiters();
        Ok(Submitted::Created(id))
    }

    /// Add prerequisite edges to a `pending`/`ready` job.
    pub fn add_dependencies(&self, job_id: JobId, dependency_ids: &[JobId]) -> Result<JobSnapshot> {
        match self.shared.repo.add_dependencies(job_id, dependency_ids) {
            Ok(t) => {
                info!(job_id = %job_id, added = dependency_ids.len(), "dependencies added");
                if t.from != t.job.status {
                    self.shared
                        .lifecycle
                        .record_applied(&t, "waiting on new dependencies")?;
                }
                self.snapshot_of(&t.job)
            }
            Err(RepositoryError::NotFound(id)) => Err(JobdagError::JobNotFound(id)),
            Err(RepositoryError::StateConflict { actual, .. }) => Err(JobdagError::InvalidState {
                job_id,
                status: actual,
            }),
            Err(err @ RepositoryError::Poisoned) => Err(err.into()),
            Err(err) => Err(ValidationError::from(err).into()),
        }
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobSnapshot> {
        let job = self.job(job_id)?;
        self.snapshot_of(&job)
    }

    /// Cancel a job.
    ///
    /// `pending`/`ready` jobs are cancelled at once. For a `running` job the
    /// cancel flag is set and the attempt is signalled. Terminal jobs answer
    /// [`JobdagError::InvalidState`].
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        loop {
            let job = self.job(job_id)?;
            match job.status {
                JobStatus::Pending | JobStatus::Ready => {
                    let update = StatusUpdate::to(JobStatus::Cancelled).expecting(job.status);
                    match self.shared.lifecycle.apply(job_id, update, "cancelled by user") {
                        Ok(_) => {
                            self.shared.wakeup.notify_waiters();
                            return Ok(CancelOutcome::Cancelled);
                        }
                        Err(RepositoryError::StateConflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                JobStatus::Running => match self.shared.repo.request_cancel(job_id) {
                    Ok(_) => {
                        let signalled = self.shared.signal_cancel(job_id);
                        debug!(job_id = %job_id, signalled, "cancel requested for running job");
                        self.shared
                            .lifecycle
                            .note(job_id, JobStatus::Running, "cancel requested")?;
                        return Ok(CancelOutcome::Requested);
                    }
                    Err(RepositoryError::StateConflict { .. }) => continue,
                    Err(e) => return Err(e.into()),
                },
                status => return Err(JobdagError::InvalidState { job_id, status }),
            }
        }
    }

    pub fn subscribe_status_changes(&self, scope: WatchScope) -> StatusSubscription {
        self.shared.lifecycle.events().subscribe(scope)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSnapshot>> {
        let jobs = self.shared.repo.list_jobs(filter)?;
        self.snapshots(&jobs)
    }

    pub fn job_logs(&self, job_id: JobId) -> Result<Vec<JobLogEntry>> {
        self.job(job_id)?;
        Ok(self.shared.repo.logs(job_id)?)
    }

    pub fn attempts(&self, job_id: JobId) -> Result<Vec<ExecutionAttempt>> {
        self.job(job_id)?;
        Ok(self.shared.repo.attempts(job_id)?)
    }

    /// `pending` jobs that can never become ready because a prerequisite,
    /// directly or through other stuck jobs, ended `failed` or `cancelled`.
    pub fn stuck_jobs(&self) -> Result<Vec<JobSnapshot>> {
        let pending = self.all_with_status(JobStatus::Pending)?;
        let stuck = self.stuck_set(&pending)?;
        let jobs: Vec<Job> = pending
            .into_iter()
            .filter(|j| stuck.contains(&j.id))
            .collect();
        self.snapshots(&jobs)
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        self.shared.allocator.usage()
    }

    /// Spawn `workers` dispatch loops on the current tokio runtime.
    pub fn start_workers(&self, workers: usize) -> WorkerPool {
        let shutdown = CancellationToken::new();
        let interrupt = CancellationToken::new();
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|worker| {
                let dispatch = DispatchLoop::new(
                    worker,
                    Arc::clone(&self.shared),
                    shutdown.clone(),
                    interrupt.clone(),
                );
                tokio::spawn(dispatch.run())
            })
            .collect();

        info!(workers, "worker pool started");
        WorkerPool {
            handles,
            shutdown,
            interrupt,
            shutdown_timeout: self.shared.settings.shutdown_timeout,
        }
    }

    fn job(&self, job_id: JobId) -> Result<Job> {
        self.shared
            .repo
            .get_job(job_id)?
            .ok_or(JobdagError::JobNotFound(job_id))
    }

    fn all_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        Ok(self.shared.repo.list_jobs(&JobFilter {
            status: Some(status),
            limit: usize::MAX,
            ..JobFilter::default()
        })?)
    }

    /// Fixpoint over `pending` jobs: stuck if any prerequisite is failed,
    /// cancelled or itself stuck.
    fn stuck_set(&self, pending: &[Job]) -> Result<HashSet<JobId>> {
        let mut deps: Vec<(JobId, Vec<(JobId, Option<JobStatus>)>)> = Vec::with_capacity(pending.len());
        for job in pending {
            deps.push((job.id, self.shared.repo.dependency_statuses(job.id)?));
        }

        let mut stuck = HashSet::new();
        loop {
            let before = stuck.len();
            for (id, prereqs) in &deps {
                if stuck.contains(id) {
                    continue;
                }
                let blocked = prereqs.iter().any(|(dep, status)| {
                    matches!(status, Some(JobStatus::Failed | JobStatus::Cancelled))
                        || stuck.contains(dep)
                });
                if blocked {
                    stuck.insert(*id);
                }
            }
            if stuck.len() == before {
                return Ok(stuck);
            }
        }
    }

    fn snapshot_of(&self, job: &Job) -> Result<JobSnapshot> {
        let mut snaps = self.snapshots(std::slice::from_ref(job))?;
        snaps
            .pop()
            .ok_or(JobdagError::JobNotFound(job.id))
    }

    fn snapshots(&self, jobs: &[Job]) -> Result<Vec<JobSnapshot>> {
        let queue: HashMap<JobId, usize> = self
            .shared
            .admission
            .queued()?
            .iter()
            .enumerate()
            .map(|(i, j)| (j.id, i + 1))
            .collect();

        let needs_stuck = jobs.iter().any(|j| j.status == JobStatus::Pending);
        let stuck = if needs_stuck {
            let pending = self.all_with_status(JobStatus::Pending)?;
            self.stuck_set(&pending)?
        } else {
            HashSet::new()
        };

        jobs.iter()
            .map(|job| {
                let blocked: Vec<JobId> = self
                    .shared
                    .repo
                    .dependency_statuses(job.id)?
                    .into_iter()
                    .filter(|(dep, status)| {
                        matches!(status, Some(JobStatus::Failed | JobStatus::Cancelled))
                            || stuck.contains(dep)
                    })
                    .map(|(dep, _)| dep)
                    .collect();
                Ok(JobSnapshot::from_job(job, blocked, queue.get(&job.id).copied()))
            })
            .collect()
    }
}

/// Handle to the running dispatch loops.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    interrupt: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Token that starts a graceful shutdown when cancelled (e.g. from a
    /// Ctrl-C handler).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait until the shutdown token is cancelled, then drain.
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        self.drain().await;
    }

    /// Stop claiming new jobs and drain.
    ///
    /// In-flight attempts get up to the shutdown timeout to finish; after
    /// that they are interrupted (recorded as `interrupted` and sent through
    /// the retry path).
    pub async fn shutdown(self) {
        info!("shutdown requested; no new jobs will be claimed");
        self.shutdown.cancel();
        self.drain().await;
    }

    async fn drain(self) {
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut handles = self.handles.into_iter();

        for mut handle in handles.by_ref() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => log_join(joined),
                Err(_) => {
                    warn!(
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "shutdown timeout elapsed; interrupting in-flight attempts"
                    );
                    self.interrupt.cancel();
                    log_join(handle.await);
                    break;
                }
            }
        }
        for handle in handles {
            log_join(handle.await);
        }
        info!("worker pool stopped");
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "dispatch loop panicked");
    }
}
