#![allow(dead_code)]

use std::time::Duration;

use jobdag::config::{ClassBudget, ConfigFile, JobConfig, RawConfigFile};
use jobdag::job::{JobId, JobSpec, ResourceRequest, RetryPolicy};
use jobdag::types::Priority;

/// Builder for `JobSpec` to simplify test setup.
pub struct JobSpecBuilder {
    spec: JobSpec,
}

impl JobSpecBuilder {
    pub fn new(job_type: &str) -> Self {
        Self {
            spec: JobSpec::new(job_type),
        }
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.spec.id = Some(id);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.spec.payload = payload;
        self
    }

    /// Shorthand for a `{"name": ...}` payload, which the fake handlers record.
    pub fn named(self, name: &str) -> Self {
        self.payload(serde_json::json!({ "name": name }))
    }

    pub fn idempotency_key(mut self, key: &str) -> Self {
        self.spec.idempotency_key = Some(key.to_string());
        self
    }

    pub fn resources(mut self, cpu_units: u64, memory_units: u64) -> Self {
        self.spec.resources = ResourceRequest::new(cpu_units, memory_units);
        self
    }

    pub fn retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.spec.retry_policy = Some(RetryPolicy {
            max_attempts,
            base_delay,
            max_delay: base_delay.max(Duration::from_secs(60)),
            backoff_multiplier: 2.0,
        });
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.spec.retry_policy = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    pub fn after(mut self, dep: JobId) -> Self {
        self.spec.depends_on.push(dep);
        self
    }

    pub fn build(self) -> JobSpec {
        self.spec
    }
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_job(mut self, name: &str, job: JobConfig) -> Self {
        self.config.job.insert(name.to_string(), job);
        self
    }

    pub fn budget(mut self, cpu_units: u64, memory_units: u64) -> Self {
        self.config.budget.cpu_units = cpu_units;
        self.config.budget.memory_units = memory_units;
        self
    }

    pub fn class_budget(mut self, job_type: &str, cpu_units: u64, memory_units: u64) -> Self {
        self.config.budget.class.insert(
            job_type.to_string(),
            ClassBudget {
                cpu_units,
                memory_units,
            },
        );
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.dispatch.workers = workers;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `JobConfig`.
pub struct JobConfigBuilder {
    job: JobConfig,
}

impl JobConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            job: JobConfig {
                job_type: "command".to_string(),
                priority: Priority::Normal,
                cmd: Some(cmd.to_string()),
                payload: None,
                after: vec![],
                cpu_units: None,
                memory_units: None,
                timeout_ms: None,
                idempotency_key: None,
                max_attempts: None,
            },
        }
    }

    pub fn job_type(mut self, job_type: &str) -> Self {
        self.job.job_type = job_type.to_string();
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.job.after.push(dep.to_string());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn resources(mut self, cpu_units: u64, memory_units: u64) -> Self {
        self.job.cpu_units = Some(cpu_units);
        self.job.memory_units = Some(memory_units);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.job.max_attempts = Some(max_attempts);
        self
    }

    pub fn build(self) -> JobConfig {
        self.job
    }
}
