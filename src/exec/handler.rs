// src/exec/handler.rs

//! Pluggable job handler abstraction.
//!
//! The dispatch loop never knows what a job does. It resolves a
//! [`JobHandler`] for the job's type from the [`HandlerRegistry`] and awaits
//! the future it returns. Production code registers
//! [`CommandHandler`](super::command::CommandHandler); tests register fakes
//! from `jobdag-test-utils`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::errors::ExecutionError;
use crate::job::JobId;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'a>>;

/// Everything a handler gets to see about one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub job_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: serde_json::Value,
    /// Fired when a client cancels the job. Handlers may check it at their
    /// own checkpoints; the runner stops waiting once the grace period ends.
    pub cancel: CancellationToken,
}

/// Executes the payload of one job type.
pub trait JobHandler: Send + Sync {
    fn execute(&self, ctx: ExecutionContext) -> HandlerFuture<'_>;
}

/// Job type to handler lookup, with an optional fallback.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Used for any job type without its own handler.
    pub fn set_fallback(&mut self, handler: Arc<dyn JobHandler>) {
        self.fallback = Some(handler);
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(job_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl JobHandler for Named {
        fn execute(&self, _ctx: ExecutionContext) -> HandlerFuture<'_> {
            let name = self.0;
            Box::pin(async move { Err(ExecutionError::failed(name)) })
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            job_id: JobId::new(),
            job_type: "x".into(),
            attempt: 1,
            payload: serde_json::Value::Null,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn registered_type_wins_over_fallback() {
        let mut reg = HandlerRegistry::new();
        reg.register("email", Arc::new(Named("email")));
        reg.set_fallback(Arc::new(Named("fallback")));

        let h = reg.resolve("email").unwrap();
        assert_eq!(h.execute(ctx()).await, Err(ExecutionError::failed("email")));

        let h = reg.resolve("other").unwrap();
        assert_eq!(
            h.execute(ctx()).await,
            Err(ExecutionError::failed("fallback"))
        );
    }

    #[test]
    fn unknown_type_without_fallback_resolves_to_none() {
        let mut reg = HandlerRegistry::new();
        reg.register("email", Arc::new(Named("email")));
        assert!(reg.resolve("report").is_none());
        assert_eq!(reg.job_types(), vec!["email"]);
    }
}
