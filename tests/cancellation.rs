// tests/cancellation.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use jobdag::engine::{CancelOutcome, DispatchSettings, Engine};
use jobdag::errors::JobdagError;
use jobdag::job::JobId;
use jobdag::types::{AttemptOutcome, JobStatus};
use jobdag_test_utils::builders::JobSpecBuilder;
use jobdag_test_utils::fake_handlers::{GateHandler, RecordingHandler, SleepHandler};
use jobdag_test_utils::{fast_settings, init_tracing, wait_for_status};

#[tokio::test]
async fn queued_job_is_cancelled_immediately_and_never_runs() {
    init_tracing();
    let handler = RecordingHandler::new();
    let log = handler.log();
    let engine = Engine::builder()
        .handler("work", Arc::new(handler))
        .dispatch(fast_settings(1))
        .build();

    let ready = engine.submit(JobSpecBuilder::new("work").build()).unwrap().id();
    let pending = engine
        .submit(JobSpecBuilder::new("work").after(ready).build())
        .unwrap()
        .id();

    assert_eq!(engine.cancel(pending).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(engine.cancel(ready).unwrap(), CancelOutcome::Cancelled);

    let pool = engine.start_workers(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown().await;

    assert!(log.is_empty());
    for id in [ready, pending] {
        let snap = engine.get_status(id).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(snap.completed_at.is_some());
        let logs = engine.job_logs(id).unwrap();
        assert_eq!(logs.last().unwrap().message, "cancelled by user");
    }
}

#[tokio::test]
async fn running_job_observes_the_cancel_flag() {
    init_tracing();
    let gate = GateHandler::new();
    let engine = Engine::builder()
        .handler("gate", Arc::new(gate.clone()))
        .dispatch(fast_settings(1))
        .build();

    let id = engine.submit(JobSpecBuilder::new("gate").build()).unwrap().id();
    let pool = engine.start_workers(1);
    wait_for_status(&engine, id, JobStatus::Running).await;

    assert_eq!(engine.cancel(id).unwrap(), CancelOutcome::Requested);
    wait_for_status(&engine, id, JobStatus::Cancelled).await;
    pool.shutdown().await;

    let attempts = engine.attempts(id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Cancelled);
    assert_eq!(engine.resource_usage().active_reservations, 0);

    let messages: Vec<String> = engine
        .job_logs(id)
        .unwrap()
        .into_iter()
        .map(|l| l.message)
        .collect();
    assert!(messages.contains(&"cancel requested".to_string()));
    assert_eq!(messages.last().map(String::as_str), Some("cancelled by user"));
}

#[tokio::test]
async fn stubborn_job_is_abandoned_after_the_grace_period() {
    init_tracing();
    let engine = Engine::builder()
        .handler("slow", Arc::new(SleepHandler::stubborn(Duration::from_secs(10))))
        .dispatch(fast_settings(1))
        .build();

    let id = engine.submit(JobSpecBuilder::new("slow").build()).unwrap().id();
    let pool = engine.start_workers(1);
    wait_for_status(&engine, id, JobStatus::Running).await;

    let started = Instant::now();
    engine.cancel(id).unwrap();
    wait_for_status(&engine, id, JobStatus::Cancelled).await;
    let took = started.elapsed();
    pool.shutdown().await;

    // fast_settings uses a 100ms grace period.
    assert!(took >= Duration::from_millis(100), "took {took:?}");
    assert!(took < Duration::from_secs(3), "took {took:?}");
    assert_eq!(
        engine.attempts(id).unwrap()[0].outcome,
        AttemptOutcome::Cancelled
    );
    assert_eq!(engine.resource_usage().active_reservations, 0);
}

#[tokio::test]
async fn attempt_finishing_inside_grace_still_ends_cancelled() {
    init_tracing();
    let settings = DispatchSettings {
        cancel_grace: Duration::from_secs(2),
        ..fast_settings(1)
    };
    let engine = Engine::builder()
        .handler(
            "work",
            Arc::new(RecordingHandler::with_delay(Duration::from_millis(300))),
        )
        .dispatch(settings)
        .build();

    let id = engine.submit(JobSpecBuilder::new("work").build()).unwrap().id();
    let pool = engine.start_workers(1);
    wait_for_status(&engine, id, JobStatus::Running).await;
    engine.cancel(id).unwrap();

    let snap = wait_for_status(&engine, id, JobStatus::Cancelled).await;
    pool.shutdown().await;

    // The attempt itself is recorded as it happened.
    assert_eq!(
        engine.attempts(id).unwrap()[0].outcome,
        AttemptOutcome::Succeeded
    );
    assert_eq!(snap.attempt_count, 1);
}

#[tokio::test]
async fn cancelling_a_terminal_job_is_an_invalid_state() {
    init_tracing();
    let engine = Engine::builder()
        .handler("work", Arc::new(RecordingHandler::new()))
        .dispatch(fast_settings(1))
        .build();

    let id = engine.submit(JobSpecBuilder::new("work").build()).unwrap().id();
    let pool = engine.start_workers(1);
    wait_for_status(&engine, id, JobStatus::Succeeded).await;
    pool.shutdown().await;

    assert!(matches!(
        engine.cancel(id),
        Err(JobdagError::InvalidState {
            status: JobStatus::Succeeded,
            ..
        })
    ));
}

#[tokio::test]
async fn cancelling_an_unknown_job_is_not_found() {
    let engine = Engine::builder().build();
    let ghost = JobId::new();
    assert!(matches!(
        engine.cancel(ghost),
        Err(JobdagError::JobNotFound(id)) if id == ghost
    ));
}
