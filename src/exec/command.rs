// src/exec/command.rs

//! Shell command handler.

use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::handler::{ExecutionContext, HandlerFuture, JobHandler};
use crate::errors::ExecutionError;
use crate::job::JobId;

/// Runs `payload.cmd` through the platform shell.
///
/// The child is spawned with `kill_on_drop`, so when the runner gives up on
/// an attempt (timeout, cancel grace, shutdown) dropping the future kills the
/// process. A non-zero exit code is an attempt failure.
///
/// The child sees `JOBDAG_JOB_ID` and `JOBDAG_ATTEMPT` in its environment.
#[derive(Debug, Clone, Default)]
pub struct CommandHandler;

impl CommandHandler {
    pub fn new() -> Self {
        Self
    }
}

impl JobHandler for CommandHandler {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_> {
        Box::pin(run_command(ctx))
    }
}

fn command_of(payload: &serde_json::Value) -> Option<&str> {
    match payload {
        serde_json::Value::String(cmd) => Some(cmd.as_str()),
        other => other.get("cmd").and_then(|c| c.as_str()),
    }
}

async fn run_command(ctx: ExecutionContext) -> Result<(), ExecutionError> {
    let Some(cmd_line) = command_of(&ctx.payload).map(str::to_owned) else {
        return Err(ExecutionError::failed("payload has no `cmd` string"));
    };

    info!(
        job_id = %ctx.job_id,
        attempt = ctx.attempt,
        cmd = %cmd_line,
        "starting job process"
    );

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&cmd_line);
        c
    };

    cmd.env("JOBDAG_JOB_ID", ctx.job_id.to_string())
        .env("JOBDAG_ATTEMPT", ctx.attempt.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for job {}", ctx.job_id))
        .map_err(|e| ExecutionError::failed(format!("{e:#}")))?;

    // Drain both pipes so the child never blocks on a full buffer.
    if let Some(stdout) = child.stdout.take() {
        drain_lines(ctx.job_id, "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        drain_lines(ctx.job_id, "stderr", stderr);
    }

    tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("waiting for process of job {}", ctx.job_id))
                .map_err(|e| ExecutionError::failed(format!("{e:#}")))?;
            let code = status.code().unwrap_or(-1);
            info!(
                job_id = %ctx.job_id,
                attempt = ctx.attempt,
                exit_code = code,
                success = status.success(),
                "job process exited"
            );
            if status.success() {
                Ok(())
            } else {
                Err(ExecutionError::failed(format!("process exited with code {code}")))
            }
        }

        _ = ctx.cancel.cancelled() => {
            info!(job_id = %ctx.job_id, attempt = ctx.attempt, "cancellation requested; killing process");
            if let Err(e) = child.kill().await {
                warn!(job_id = %ctx.job_id, error = %e, "failed to kill child process on cancellation");
            }
            Err(ExecutionError::Cancelled)
        }
    }
}

fn drain_lines<R>(job_id: JobId, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job_id = %job_id, stream, "{}", line);
        }
    });
}
