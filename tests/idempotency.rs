// tests/idempotency.rs

use std::sync::Arc;
use std::time::Duration;

use jobdag::engine::{Engine, Submitted};
use jobdag::job::JobFilter;
use jobdag::types::JobStatus;
use jobdag_test_utils::builders::JobSpecBuilder;
use jobdag_test_utils::fake_handlers::{FailingHandler, RecordingHandler};
use jobdag_test_utils::{fast_settings, init_tracing, wait_for_status};

fn keyed(job_type: &str, key: &str) -> jobdag::job::JobSpec {
    JobSpecBuilder::new(job_type)
        .idempotency_key(key)
        .retry(1, Duration::from_millis(10))
        .build()
}

#[tokio::test]
async fn duplicate_key_resolves_to_the_existing_job() {
    let engine = Engine::builder().build();

    let first = engine.submit(keyed("email", "welcome-42")).unwrap();
    let second = engine.submit(keyed("email", "welcome-42")).unwrap();

    assert!(first.is_new());
    assert_eq!(second, Submitted::Existing(first.id()));
    assert_eq!(engine.list_jobs(&JobFilter::default()).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_create_one_job() {
    let engine = Engine::builder().build();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.submit(keyed("email", "race")).unwrap()
        }));
    }

    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| r.is_new()).count(), 1);
    let id = results[0].id();
    assert!(results.iter().all(|r| r.id() == id));
    assert_eq!(engine.list_jobs(&JobFilter::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn key_is_reusable_after_permanent_failure_or_cancel() {
    init_tracing();
    let engine = Engine::builder()
        .handler("fail", Arc::new(FailingHandler::new("nope")))
        .dispatch(fast_settings(1))
        .build();

    let failed = engine.submit(keyed("fail", "nightly")).unwrap().id();
    let pool = engine.start_workers(1);
    wait_for_status(&engine, failed, JobStatus::Failed).await;
    pool.shutdown().await;

    let again = engine.submit(keyed("fail", "nightly")).unwrap();
    assert!(again.is_new());
    assert_ne!(again.id(), failed);

    engine.cancel(again.id()).unwrap();
    let third = engine.submit(keyed("fail", "nightly")).unwrap();
    assert!(third.is_new());
}

#[tokio::test]
async fn succeeded_job_keeps_its_key() {
    init_tracing();
    let engine = Engine::builder()
        .handler("email", Arc::new(RecordingHandler::new()))
        .dispatch(fast_settings(1))
        .build();

    let done = engine.submit(keyed("email", "receipt-7")).unwrap().id();
    let pool = engine.start_workers(1);
    wait_for_status(&engine, done, JobStatus::Succeeded).await;
    pool.shutdown().await;

    assert_eq!(
        engine.submit(keyed("email", "receipt-7")).unwrap(),
        Submitted::Existing(done)
    );
}
