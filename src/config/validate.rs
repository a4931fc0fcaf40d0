// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{JobdagError, Result};
use crate::job::MAX_ATTEMPTS_LIMIT;
use crate::resources::Budget;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = JobdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_budget(&raw)?;
        validate_dispatch(&raw)?;
        validate_retry(&raw)?;
        validate_jobs(&raw)?;
        validate_job_dependencies(&raw)?;
        let order = submission_order(&raw)?;
        Ok(ConfigFile::new_unchecked(raw, order))
    }
}

fn config_error(msg: impl Into<String>) -> JobdagError {
    JobdagError::ConfigError(msg.into())
}

fn validate_budget(cfg: &RawConfigFile) -> Result<()> {
    if cfg.budget.cpu_units == 0 || cfg.budget.memory_units == 0 {
        return Err(config_error(format!(
            "[budget] cpu_units and memory_units must be >= 1 (got cpu={} mem={})",
            cfg.budget.cpu_units, cfg.budget.memory_units
        )));
    }
    for (class, b) in &cfg.budget.class {
        if b.cpu_units == 0 || b.memory_units == 0 {
            return Err(config_error(format!(
                "[budget.class.{class}] cpu_units and memory_units must be >= 1"
            )));
        }
    }
    Ok(())
}

fn validate_dispatch(cfg: &RawConfigFile) -> Result<()> {
    let d = &cfg.dispatch;
    if d.workers == 0 {
        return Err(config_error("[dispatch].workers must be >= 1 (got 0)"));
    }
    if d.poll_interval_ms == 0 {
        return Err(config_error("[dispatch].poll_interval_ms must be >= 1 (got 0)"));
    }
    if d.default_timeout_ms == 0 {
        return Err(config_error("[dispatch].default_timeout_ms must be >= 1 (got 0)"));
    }
    Ok(())
}

fn validate_retry(cfg: &RawConfigFile) -> Result<()> {
    cfg.retry
        .to_policy()
        .validate()
        .map_err(|e| config_error(format!("[retry]: {e}")))
}

fn validate_jobs(cfg: &RawConfigFile) -> Result<()> {
    let budget = Budget::new(cfg.budget.cpu_units, cfg.budget.memory_units);

    for (name, job) in &cfg.job {
        if job.job_type.trim().is_empty() {
            return Err(config_error(format!("job '{name}' has an empty `type`")));
        }
        if job.job_type == "command" && job.cmd.is_none() {
            return Err(config_error(format!(
                "job '{name}' is of type \"command\" but has no `cmd`"
            )));
        }
        let request = job.resources();
        if request.cpu_units == 0 || request.memory_units == 0 {
            return Err(config_error(format!(
                "job '{name}': cpu_units and memory_units must be >= 1"
            )));
        }
        if !budget.fits(&request) {
            return Err(config_error(format!(
                "job '{name}' requests {request}, more than the budget ({budget})"
            )));
        }
        if let Some(class) = cfg.budget.class.get(&job.job_type) {
            let class_budget = Budget::new(class.cpu_units, class.memory_units);
            if !class_budget.fits(&request) {
                return Err(config_error(format!(
                    "job '{name}' requests {request}, more than the '{}' class budget ({class_budget})",
                    job.job_type
                )));
            }
        }
        if let Some(max) = job.max_attempts {
            if max == 0 || max > MAX_ATTEMPTS_LIMIT {
                return Err(config_error(format!(
                    "job '{name}': max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT} (got {max})"
                )));
            }
        }
        if job.timeout_ms == Some(0) {
            return Err(config_error(format!("job '{name}': timeout_ms must be >= 1")));
        }
    }
    Ok(())
}

fn validate_job_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, job) in cfg.job.iter() {
        for dep in job.after.iter() {
            if !cfg.job.contains_key(dep) {
                return Err(config_error(format!(
                    "job '{}' has unknown dependency '{}' in `after`",
                    name, dep
                )));
            }
            if dep == name {
                return Err(config_error(format!(
                    "job '{}' cannot depend on itself in `after`",
                    name
                )));
            }
        }
    }
    Ok(())
}

/// Topological order of the declared jobs; fails on a cycle.
///
/// Edge direction: dep -> job, so prerequisites come first.
fn submission_order(cfg: &RawConfigFile) -> Result<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.job.keys() {
        graph.add_node(name.as_str());
    }
    for (name, job) in cfg.job.iter() {
        for dep in job.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(JobdagError::DagCycle(format!(
            "cycle detected among declared jobs involving '{}'",
            cycle.node_id()
        ))),
    }
}
