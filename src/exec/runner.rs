// src/exec/runner.rs

//! Drive one handler future under a timeout, a cancel grace period and the
//! pool's interrupt signal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{ExecutionContext, JobHandler};
use crate::errors::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptLimits {
    pub timeout: Duration,
    /// How long a cancelled attempt may keep running before it is abandoned.
    pub cancel_grace: Duration,
}

/// Run `handler` for one attempt.
///
/// - The handler finishing first wins, even after a cancel request.
/// - `limits.timeout` elapsing yields [`ExecutionError::Timeout`].
/// - `ctx.cancel` firing starts the grace period; when it elapses the attempt
///   is abandoned with [`ExecutionError::Cancelled`].
/// - `interrupt` firing abandons the attempt at once with
///   [`ExecutionError::Interrupted`].
///
/// Abandoning drops the handler future, which is how in-flight work (for
/// example a child process with `kill_on_drop`) gets torn down.
pub async fn run_attempt(
    handler: Arc<dyn JobHandler>,
    ctx: ExecutionContext,
    limits: AttemptLimits,
    interrupt: &CancellationToken,
) -> Result<(), ExecutionError> {
    let job_id = ctx.job_id;
    let attempt = ctx.attempt;
    let cancel = ctx.cancel.clone();

    let work = handler.execute(ctx);
    tokio::pin!(work);
    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);

    tokio::select! {
        biased;

        res = &mut work => return res,

        _ = &mut deadline => {
            warn!(job_id = %job_id, attempt, timeout_ms = limits.timeout.as_millis() as u64, "attempt timed out");
            return Err(ExecutionError::Timeout(limits.timeout));
        }

        _ = interrupt.cancelled() => {
            warn!(job_id = %job_id, attempt, "attempt interrupted by shutdown");
            return Err(ExecutionError::Interrupted);
        }

        _ = cancel.cancelled() => {
            debug!(job_id = %job_id, attempt, grace_ms = limits.cancel_grace.as_millis() as u64, "cancel observed; waiting for grace period");
        }
    }

    tokio::select! {
        biased;

        res = &mut work => res,

        _ = &mut deadline => {
            warn!(job_id = %job_id, attempt, "attempt timed out during cancel grace");
            Err(ExecutionError::Timeout(limits.timeout))
        }

        _ = interrupt.cancelled() => Err(ExecutionError::Interrupted),

        _ = tokio::time::sleep(limits.cancel_grace) => {
            info!(job_id = %job_id, attempt, "cancel grace elapsed; abandoning attempt");
            Err(ExecutionError::Cancelled)
        }
    }
}
