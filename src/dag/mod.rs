// src/dag/mod.rs

//! Job dependency graph.
//!
//! - [`graph`] stores prerequisite edges between jobs.
//! - [`resolver`] rejects edges that would close a cycle and decides when a
//!   job's prerequisites are satisfied.

pub mod graph;
pub mod resolver;

pub use graph::DependencyGraph;
pub use resolver::{blocked_by, find_cycle, is_ready};
