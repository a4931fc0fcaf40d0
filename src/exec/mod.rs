// src/exec/mod.rs

//! Job execution layer.
//!
//! - [`handler`] defines the [`JobHandler`] trait and the per-type
//!   [`HandlerRegistry`]. Tests plug fake handlers in here.
//! - [`command`] is the production handler that runs `payload.cmd` in a shell.
//! - [`runner`] wraps one handler call with the job timeout, the cooperative
//!   cancel grace period and the shutdown interrupt.

pub mod command;
pub mod handler;
pub mod runner;

pub use command::CommandHandler;
pub use handler::{ExecutionContext, HandlerFuture, HandlerRegistry, JobHandler};
pub use runner::{AttemptLimits, run_attempt};
