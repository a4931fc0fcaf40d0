// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod job;
pub mod logging;
pub mod repo;
pub mod resources;
pub mod retry;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_or_default};
use crate::engine::{Engine, EngineBuilder};
use crate::exec::CommandHandler;
use crate::job::JobId;
use crate::types::JobStatus;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - engine construction and the worker pool
/// - submission of the jobs declared in the config
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let engine = EngineBuilder::from_config(&cfg)
        .fallback_handler(Arc::new(CommandHandler::new()))
        .build();

    let workers = args.workers.unwrap_or(cfg.dispatch.workers);
    let pool = engine.start_workers(workers);
    let shutdown = pool.shutdown_token();

    // Ctrl-C → graceful shutdown.
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("Ctrl-C received");
            token.cancel();
        });
    }

    let declared = submit_declared(&engine, &cfg)?;
    info!(jobs = declared.len(), "declared jobs submitted");

    if !args.once {
        pool.wait().await;
        return Ok(());
    }

    let poll = engine.settings().poll_interval.min(Duration::from_millis(200));
    wait_until_settled(&engine, &declared, poll, &shutdown).await?;
    pool.shutdown().await;

    report(&engine, &declared)
}

/// Submit every `[job.<name>]` with dependencies first, so each `after`
/// name already has an id when its dependents are submitted.
fn submit_declared(engine: &Engine, cfg: &ConfigFile) -> Result<Vec<(String, JobId)>> {
    let default_retry = cfg.retry_policy();
    let mut ids: HashMap<&str, JobId> = HashMap::new();
    let mut declared = Vec::with_capacity(cfg.job.len());

    for name in cfg.submission_order() {
        let Some(job_cfg) = cfg.job.get(name) else {
            continue;
        };
        let depends_on = job_cfg
            .after
            .iter()
            .filter_map(|dep| ids.get(dep.as_str()).copied())
            .collect();

        let spec = job_cfg.to_spec(JobId::new(), depends_on, &default_retry);
        let submitted = engine
            .submit(spec)
            .with_context(|| format!("submitting job '{name}'"))?;
        if !submitted.is_new() {
            debug!(job = %name, job_id = %submitted.id(), "job deduplicated by idempotency key");
        }

        ids.insert(name.as_str(), submitted.id());
        declared.push((name.clone(), submitted.id()));
    }

    Ok(declared)
}

/// Poll until every declared job is terminal or stuck behind a failed
/// prerequisite, or until shutdown is requested.
async fn wait_until_settled(
    engine: &Engine,
    declared: &[(String, JobId)],
    poll: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let stuck: Vec<JobId> = engine.stuck_jobs()?.into_iter().map(|s| s.id).collect();
        let mut settled = true;
        for (_, id) in declared {
            let snap = engine.get_status(*id)?;
            if !snap.status.is_terminal() && !stuck.contains(id) {
                settled = false;
                break;
            }
        }
        if settled {
            debug!("all declared jobs settled");
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Print one line per declared job and fail if any did not succeed.
fn report(engine: &Engine, declared: &[(String, JobId)]) -> Result<()> {
    let mut unsuccessful = 0usize;
    for (name, id) in declared {
        let snap = engine.get_status(*id)?;
        let succeeded = snap.status == JobStatus::Succeeded;
        let detail = if snap.is_stuck() {
            " (blocked by a failed prerequisite)".to_string()
        } else if let (false, Some(err)) = (succeeded, &snap.last_error) {
            format!(" ({err})")
        } else {
            String::new()
        };
        println!(
            "{name}: {} after {} attempt(s){detail}",
            snap.status, snap.attempt_count
        );
        if !succeeded {
            unsuccessful += 1;
        }
    }

    if unsuccessful > 0 {
        warn!(unsuccessful, "some jobs did not succeed");
        anyhow::bail!("{unsuccessful} of {} job(s) did not succeed", declared.len());
    }
    Ok(())
}

/// Simple dry-run output: budget, defaults and the declared jobs in
/// submission order.
fn print_dry_run(cfg: &ConfigFile) {
    println!("jobdag dry-run");
    println!("  budget = {}", cfg.budget());
    for (class, budget) in &cfg.budget.class {
        println!(
            "  budget.class.{class} = cpu={} mem={}",
            budget.cpu_units, budget.memory_units
        );
    }
    println!("  dispatch.workers = {}", cfg.dispatch.workers);
    println!(
        "  retry = max_attempts={} base_delay_ms={} max_delay_ms={} multiplier={}",
        cfg.retry.max_attempts,
        cfg.retry.base_delay_ms,
        cfg.retry.max_delay_ms,
        cfg.retry.backoff_multiplier
    );
    println!();

    println!("jobs ({}):", cfg.job.len());
    for name in cfg.submission_order() {
        let Some(job) = cfg.job.get(name) else {
            continue;
        };
        println!("  - {name}");
        println!("      type: {}", job.job_type);
        println!("      priority: {}", job.priority);
        println!("      resources: {}", job.resources());
        if let Some(ref cmd) = job.cmd {
            println!("      cmd: {cmd}");
        }
        if !job.after.is_empty() {
            println!("      after: {:?}", job.after);
        }
        if let Some(ref key) = job.idempotency_key {
            println!("      idempotency_key: {key}");
        }
        if let Some(timeout_ms) = job.timeout_ms {
            println!("      timeout_ms: {timeout_ms}");
        }
        if let Some(max_attempts) = job.max_attempts {
            println!("      max_attempts: {max_attempts}");
        }
    }

    debug!("dry-run complete (no execution)");
}
