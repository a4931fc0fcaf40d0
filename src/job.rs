// src/job.rs

//! Job records and the value types that travel with them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ValidationError;
use crate::types::{AttemptOutcome, JobStatus, Priority};

/// Upper bound on `RetryPolicy::max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Default page size for [`JobFilter`].
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Abstract resource units requested by one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_units: u64,
    pub memory_units: u64,
}

impl ResourceRequest {
    pub fn new(cpu_units: u64, memory_units: u64) -> Self {
        Self {
            cpu_units,
            memory_units,
        }
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} mem={}", self.cpu_units, self.memory_units)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ValidationError::Malformed(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT} (got {})",
                self.max_attempts
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ValidationError::Malformed(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ValidationError::Malformed(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// What a client submits.
///
/// `retry_policy` and `timeout` fall back to the engine defaults when `None`.
/// `id` lets a client pick its own identifier; one is generated otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub id: Option<JobId>,
    pub job_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub resources: ResourceRequest,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub depends_on: Vec<JobId>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            priority: Priority::Normal,
            payload: serde_json::Value::Null,
            idempotency_key: None,
            resources: ResourceRequest::new(1, 1),
            retry_policy: None,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    /// Shape checks that need no repository access.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job_type.trim().is_empty() {
            return Err(ValidationError::Malformed(
                "job type must not be empty".to_string(),
            ));
        }
        if self.resources.cpu_units == 0 {
            return Err(ValidationError::Malformed(
                "cpu_units must be >= 1".to_string(),
            ));
        }
        if self.resources.memory_units == 0 {
            return Err(ValidationError::Malformed(
                "memory_units must be >= 1".to_string(),
            ));
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(ValidationError::Malformed(
                    "idempotency_key must not be blank".to_string(),
                ));
            }
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ValidationError::Malformed(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub resources: ResourceRequest,
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    /// Number of attempts started so far.
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    /// Insertion order, assigned by the repository. Breaks `created_at` ties.
    pub seq: u64,
    pub dependencies: Vec<JobId>,
    pub last_error: Option<String>,
    /// Set when a cancel arrives while the job is running.
    pub cancel_requested: bool,
}

impl Job {
    /// Build a fresh `pending` record from a validated spec.
    pub fn from_spec(
        spec: JobSpec,
        default_retry: &RetryPolicy,
        default_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut dependencies = Vec::with_capacity(spec.depends_on.len());
        for dep in spec.depends_on {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Self {
            id: spec.id.unwrap_or_default(),
            job_type: spec.job_type,
            priority: spec.priority,
            status: JobStatus::Pending,
            payload: spec.payload,
            idempotency_key: spec.idempotency_key,
            resources: spec.resources,
            retry_policy: spec.retry_policy.unwrap_or_else(|| default_retry.clone()),
            timeout: spec.timeout.unwrap_or(default_timeout),
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            next_eligible_at: now,
            seq: 0,
            dependencies,
            last_error: None,
            cancel_requested: false,
        }
    }

    /// Admission order: higher priority first, then older first.
    pub fn admission_cmp(&self, other: &Job) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }

    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }
}

/// Append-only record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub job_id: JobId,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

/// One line of a job's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl JobLogEntry {
    pub fn new(job_id: JobId, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id,
            status,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Read-only view handed to API consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub job_type: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub idempotency_key: Option<String>,
    pub resources: ResourceRequest,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dependencies: Vec<JobId>,
    /// Prerequisites that ended `failed` or `cancelled`; a non-empty list
    /// means this job can never become ready.
    pub blocked_by: Vec<JobId>,
    /// 1-based position in admission order while `pending`/`ready`.
    pub position_in_queue: Option<usize>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job, blocked_by: Vec<JobId>, position_in_queue: Option<usize>) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            status: job.status,
            idempotency_key: job.idempotency_key.clone(),
            resources: job.resources,
            attempt_count: job.attempt_count,
            max_attempts: job.retry_policy.max_attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            next_eligible_at: job.next_eligible_at,
            last_error: job.last_error.clone(),
            dependencies: job.dependencies.clone(),
            blocked_by,
            position_in_queue,
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.status == JobStatus::Pending && !self.blocked_by.is_empty()
    }
}

/// Listing filter.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<Priority>,
    pub job_type: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            job_type: None,
            offset: 0,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.priority.is_none_or(|p| job.priority == p)
            && self
                .job_type
                .as_deref()
                .is_none_or(|t| job.job_type == t)
    }
}
