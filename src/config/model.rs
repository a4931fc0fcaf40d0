// src/config/model.rs

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::DispatchSettings;
use crate::job::{JobId, JobSpec, ResourceRequest, RetryPolicy};
use crate::resources::Budget;
use crate::types::Priority;

/// Configuration exactly as read from TOML, before validation.
///
/// ```toml
/// [budget]
/// cpu_units = 8
/// memory_units = 4096
///
/// [budget.class.report]
/// cpu_units = 2
/// memory_units = 1024
///
/// [dispatch]
/// workers = 4
///
/// [retry]
/// max_attempts = 3
///
/// [job.fetch]
/// cmd = "curl -fsS https://example.com -o /tmp/page"
///
/// [job.parse]
/// cmd = "wc -l /tmp/page"
/// after = ["fetch"]
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub budget: BudgetSection,

    #[serde(default)]
    pub dispatch: DispatchSection,

    /// Default retry policy for jobs that do not set their own.
    #[serde(default)]
    pub retry: RetrySection,

    /// Jobs to submit at startup, from `[job.<name>]`.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// Validated configuration. Only obtainable through
/// `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub budget: BudgetSection,
    pub dispatch: DispatchSection,
    pub retry: RetrySection,
    pub job: BTreeMap<String, JobConfig>,
    /// Job names with every `after` entry before the job itself.
    submission_order: Vec<String>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile, submission_order: Vec<String>) -> Self {
        Self {
            budget: raw.budget,
            dispatch: raw.dispatch,
            retry: raw.retry,
            job: raw.job,
            submission_order,
        }
    }

    pub fn submission_order(&self) -> &[String] {
        &self.submission_order
    }

    pub fn budget(&self) -> Budget {
        Budget::new(self.budget.cpu_units, self.budget.memory_units)
    }

    pub fn class_budgets(&self) -> HashMap<String, Budget> {
        self.budget
            .class
            .iter()
            .map(|(name, c)| (name.clone(), Budget::new(c.cpu_units, c.memory_units)))
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        let d = &self.dispatch;
        DispatchSettings {
            workers: d.workers,
            poll_interval: Duration::from_millis(d.poll_interval_ms),
            default_timeout: Duration::from_millis(d.default_timeout_ms),
            cancel_grace: Duration::from_millis(d.cancel_grace_ms),
            shutdown_timeout: Duration::from_millis(d.shutdown_timeout_ms),
            ..DispatchSettings::default()
        }
    }
}

/// `[budget]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_cpu_units")]
    pub cpu_units: u64,

    #[serde(default = "default_memory_units")]
    pub memory_units: u64,

    /// Optional per-job-type budgets from `[budget.class.<type>]`, checked
    /// on top of the global one.
    #[serde(default)]
    pub class: BTreeMap<String, ClassBudget>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClassBudget {
    pub cpu_units: u64,
    pub memory_units: u64,
}

fn default_cpu_units() -> u64 {
    8
}

fn default_memory_units() -> u64 {
    4096
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            cpu_units: default_cpu_units(),
            memory_units: default_memory_units(),
            class: BTreeMap::new(),
        }
    }
}

/// `[dispatch]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_cancel_grace_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            default_timeout_ms: default_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// `[job.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Handler key; `"command"` runs `cmd` in a shell.
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,

    #[serde(default)]
    pub priority: Priority,

    /// Shell command, merged into the payload as `cmd`.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Free-form payload for custom handlers.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    /// Names of jobs this one waits for.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub cpu_units: Option<u64>,

    #[serde(default)]
    pub memory_units: Option<u64>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub idempotency_key: Option<String>,

    /// Overrides `[retry].max_attempts` for this job.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_job_type() -> String {
    "command".to_string()
}

impl JobConfig {
    pub fn resources(&self) -> ResourceRequest {
        ResourceRequest::new(self.cpu_units.unwrap_or(1), self.memory_units.unwrap_or(1))
    }

    /// `payload` with `cmd` folded in.
    pub fn payload(&self) -> serde_json::Value {
        let mut payload = self.payload.clone().unwrap_or(serde_json::Value::Null);
        if let Some(cmd) = &self.cmd {
            match &mut payload {
                serde_json::Value::Object(map) => {
                    map.insert("cmd".to_string(), serde_json::Value::String(cmd.clone()));
                }
                _ => payload = serde_json::json!({ "cmd": cmd }),
            }
        }
        payload
    }

    /// Build the submission for this job. `depends_on` carries the ids
    /// already assigned to the jobs named in `after`.
    pub fn to_spec(&self, id: JobId, depends_on: Vec<JobId>, default_retry: &RetryPolicy) -> JobSpec {
        let mut spec = JobSpec::new(self.job_type.clone());
        spec.id = Some(id);
        spec.priority = self.priority;
        spec.payload = self.payload();
        spec.idempotency_key = self.idempotency_key.clone();
        spec.resources = self.resources();
        spec.timeout = self.timeout_ms.map(Duration::from_millis);
        spec.retry_policy = self.max_attempts.map(|max_attempts| RetryPolicy {
            max_attempts,
            ..default_retry.clone()
        });
        spec.depends_on = depends_on;
        spec
    }
}
