pub mod builders;
pub mod fake_handlers;

use std::sync::Once;
use std::time::Duration;

use jobdag::engine::{DispatchSettings, Engine};
use jobdag::job::{JobId, JobSnapshot};
use jobdag::types::JobStatus;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Dispatch settings tuned for tests: short polls and grace periods.
pub fn fast_settings(workers: usize) -> DispatchSettings {
    DispatchSettings {
        workers,
        poll_interval: Duration::from_millis(20),
        default_timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_millis(100),
        shutdown_timeout: Duration::from_millis(500),
        batch_size: 32,
    }
}

/// Poll `get_status` until `pred` holds. Panics after 5 seconds.
pub async fn wait_for<F>(engine: &Engine, id: JobId, pred: F) -> JobSnapshot
where
    F: Fn(&JobSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snap = engine.get_status(id).expect("job should exist");
        if pred(&snap) {
            return snap;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting on job {id}; last snapshot: {snap:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the job reaches `status`.
pub async fn wait_for_status(engine: &Engine, id: JobId, status: JobStatus) -> JobSnapshot {
    wait_for(engine, id, |s| s.status == status).await
}
