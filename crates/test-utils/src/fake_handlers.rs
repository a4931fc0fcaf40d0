//! Fake `JobHandler`s for engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobdag::errors::ExecutionError;
use jobdag::exec::{ExecutionContext, HandlerFuture, JobHandler};
use jobdag::job::JobId;
use tokio::sync::Semaphore;

/// One observed call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub job_id: JobId,
    pub attempt: u32,
    /// `payload.name`, if the payload carried one.
    pub name: Option<String>,
}

impl Call {
    fn from_ctx(ctx: &ExecutionContext) -> Self {
        Self {
            job_id: ctx.job_id,
            attempt: ctx.attempt,
            name: ctx
                .payload
                .get("name")
                .and_then(|n| n.as_str())
                .map(str::to_owned),
        }
    }
}

/// Shared, cloneable call log.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.calls().into_iter().filter_map(|c| c.name).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records every call and succeeds, optionally after a delay.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    log: CallLog,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            log: CallLog::default(),
            delay: Some(delay),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl JobHandler for RecordingHandler {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_> {
        self.log.push(Call::from_ctx(&ctx));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok(())
        })
    }
}

/// Always fails with the same message.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    log: CallLog,
    message: String,
}

impl FailingHandler {
    pub fn new(message: &str) -> Self {
        Self {
            log: CallLog::default(),
            message: message.to_string(),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl JobHandler for FailingHandler {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_> {
        self.log.push(Call::from_ctx(&ctx));
        let message = self.message.clone();
        Box::pin(async move { Err(ExecutionError::Failed(message)) })
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyHandler {
    log: CallLog,
    failures: usize,
    seen: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            log: CallLog::default(),
            failures,
            seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl JobHandler for FlakyHandler {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_> {
        self.log.push(Call::from_ctx(&ctx));
        let n = self.seen.fetch_add(1, Ordering::SeqCst);
        let fail = n < self.failures;
        Box::pin(async move {
            if fail {
                Err(ExecutionError::failed(format!("flaky failure #{}", n + 1)))
            } else {
                Ok(())
            }
        })
    }
}

/// Sleeps for a fixed duration and tracks how many calls overlap.
///
/// With `cooperative`, the sleep ends early with `Cancelled` when the
/// attempt's cancel token fires; otherwise cancellation is ignored.
#[derive(Debug, Clone)]
pub struct SleepHandler {
    log: CallLog,
    duration: Duration,
    cooperative: bool,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        Self {
            log: CallLog::default(),
            duration,
            cooperative: true,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stubborn(duration: Duration) -> Self {
        Self {
            cooperative: false,
            ..Self::new(duration)
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobHandler for SleepHandler {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_> {
        self.log.push(Call::from_ctx(&ctx));
        Box::pin(async move {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = RunningGuard(Arc::clone(&self.running));
            self.peak.fetch_max(now, Ordering::SeqCst);

            if self.cooperative {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled),
                    _ = tokio::time::sleep(self.duration) => Ok(()),
                }
            } else {
                tokio::time::sleep(self.duration).await;
                Ok(())
            }
        })
    }
}

/// Blocks every call until the test opens the gate.
///
/// Honours cancellation while blocked.
#[derive(Debug, Clone)]
pub struct GateHandler {
    log: CallLog,
    gate: Arc<Semaphore>,
}

impl GateHandler {
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Let `n` blocked (or future) calls through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

impl Default for GateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobHandler for GateHandler {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_> {
        self.log.push(Call::from_ctx(&ctx));
        let gate = Arc::clone(&self.gate);
        Box::pin(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled),
                permit = gate.acquire_owned() => {
                    permit
                        .map(|p| p.forget())
                        .map_err(|e| ExecutionError::failed(e.to_string()))
                }
            }
        })
    }
}
