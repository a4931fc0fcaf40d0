// src/dag/graph.rs

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;

use crate::job::JobId;

/// Dependency edges between jobs.
///
/// Edge direction: job -> prerequisite. For a job `B` submitted with
/// `depends_on = [A]` we store `B -> A`, so outgoing neighbours are the
/// things a job waits on and incoming neighbours are the jobs waiting on it.
///
/// Acyclicity is not enforced here; callers run
/// [`find_cycle`](crate::dag::resolver::find_cycle) before adding edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraphMap<JobId, ()>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: JobId) {
        self.graph.add_node(job);
    }

    /// Record that `job` waits on every id in `prerequisites`.
    pub fn add_dependencies(&mut self, job: JobId, prerequisites: &[JobId]) {
        self.graph.add_node(job);
        for &dep in prerequisites {
            self.graph.add_edge(job, dep, ());
        }
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.graph.contains_node(job)
    }

    /// Direct prerequisites of `job`.
    pub fn dependencies_of(&self, job: JobId) -> Vec<JobId> {
        if !self.graph.contains_node(job) {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(job, Direction::Outgoing)
            .collect()
    }

    /// Jobs that list `job` as a direct prerequisite.
    pub fn dependents_of(&self, job: JobId) -> Vec<JobId> {
        if !self.graph.contains_node(job) {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(job, Direction::Incoming)
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
