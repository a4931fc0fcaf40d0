// tests/command_handler.rs

#![cfg(unix)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};

use jobdag::cli::CliArgs;
use jobdag::engine::Engine;
use jobdag::exec::CommandHandler;
use jobdag::types::{AttemptOutcome, JobStatus};
use jobdag_test_utils::builders::JobSpecBuilder;
use jobdag_test_utils::{fast_settings, init_tracing, wait_for_status, with_timeout};

fn command_engine() -> Engine {
    Engine::builder()
        .fallback_handler(Arc::new(CommandHandler::new()))
        .dispatch(fast_settings(2))
        .build()
}

fn cmd_spec(cmd: &str) -> JobSpecBuilder {
    JobSpecBuilder::new("command").payload(serde_json::json!({ "cmd": cmd }))
}

#[tokio::test]
async fn shell_commands_run_and_report_exit_codes() {
    init_tracing();
    let engine = command_engine();

    let ok = engine.submit(cmd_spec("true").build()).unwrap().id();
    let bad = engine
        .submit(cmd_spec("exit 7").retry(1, Duration::from_millis(10)).build())
        .unwrap()
        .id();

    let pool = engine.start_workers(2);
    wait_for_status(&engine, ok, JobStatus::Succeeded).await;
    let snap = wait_for_status(&engine, bad, JobStatus::Failed).await;
    pool.shutdown().await;

    let attempt = &engine.attempts(bad).unwrap()[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Failed);
    assert!(
        attempt
            .error_detail
            .as_deref()
            .is_some_and(|d| d.contains("code 7"))
    );
    assert!(snap.last_error.is_some());
}

#[tokio::test]
async fn slow_command_is_killed_on_timeout() {
    init_tracing();
    let engine = command_engine();

    let id = engine
        .submit(
            cmd_spec("sleep 5")
                .timeout(Duration::from_millis(200))
                .retry(1, Duration::from_millis(10))
                .build(),
        )
        .unwrap()
        .id();

    let pool = engine.start_workers(1);
    wait_for_status(&engine, id, JobStatus::Failed).await;
    pool.shutdown().await;

    let attempt = &engine.attempts(id).unwrap()[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Timeout);
    assert!(attempt.ended_at - attempt.started_at < chrono::Duration::seconds(2));
}

#[tokio::test]
async fn unknown_job_type_without_fallback_fails_the_attempt() {
    init_tracing();
    let engine = Engine::builder().dispatch(fast_settings(1)).build();
    let id = engine
        .submit(
            JobSpecBuilder::new("mystery")
                .retry(1, Duration::from_millis(10))
                .build(),
        )
        .unwrap()
        .id();

    let pool = engine.start_workers(1);
    wait_for_status(&engine, id, JobStatus::Failed).await;
    pool.shutdown().await;

    let detail = engine.attempts(id).unwrap()[0].error_detail.clone();
    assert_eq!(
        detail.as_deref(),
        Some("no handler registered for job type 'mystery'")
    );
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn once_args(config: &NamedTempFile) -> CliArgs {
    CliArgs {
        config: config.path().to_path_buf(),
        workers: Some(2),
        once: true,
        log_level: None,
        dry_run: false,
    }
}

#[tokio::test]
async fn run_once_executes_declared_jobs_in_dependency_order() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out.txt");
    let out = out.display();

    let config = write_config(&format!(
        r#"
[dispatch]
poll_interval_ms = 50

[job.first]
cmd = "echo first >> {out}"

[job.second]
cmd = "echo second >> {out}"
after = ["first"]

[job.third]
cmd = "echo third >> {out}"
after = ["second"]
priority = "critical"
"#
    ));

    with_timeout(jobdag::run(once_args(&config))).await.unwrap();

    let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(written, "first\nsecond\nthird\n");
}

#[tokio::test]
async fn run_once_stops_on_failure_and_reports_it() {
    init_tracing();
    let config = write_config(
        r#"
[dispatch]
poll_interval_ms = 50

[job.broken]
cmd = "exit 1"
max_attempts = 1

[job.downstream]
cmd = "true"
after = ["broken"]
"#,
    );

    let err = with_timeout(jobdag::run(once_args(&config)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("2 of 2"), "{err}");
}

#[tokio::test]
async fn dry_run_executes_nothing() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let config = write_config(&format!(
        "[job.touch]\ncmd = \"touch {}\"\n",
        marker.display()
    ));

    let mut args = once_args(&config);
    args.dry_run = true;
    jobdag::run(args).await.unwrap();

    assert!(!marker.exists());
}
