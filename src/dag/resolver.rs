// src/dag/resolver.rs

//! Cycle detection and readiness checks over the dependency graph.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::dag::graph::DependencyGraph;
use crate::job::JobId;
use crate::types::JobStatus;

/// Check whether giving `candidate` the edges `candidate -> p` for every
/// `p` in `prerequisites` would close a cycle.
///
/// Walks existing prerequisite edges depth-first from each new prerequisite
/// with an explicit stack, looking for `candidate`. Nodes are visited at most
/// once across all starting points, so the work is O(V + E).
///
/// Returns the offending path, starting and ending at `candidate`
/// (`[candidate, p, .., candidate]`), or `None` if the edges are safe.
pub fn find_cycle(
    graph: &DependencyGraph,
    candidate: JobId,
    prerequisites: &[JobId],
) -> Option<Vec<JobId>> {
    let mut visited: HashSet<JobId> = HashSet::new();
    // child -> node it was discovered from, for path reconstruction.
    let mut parent: HashMap<JobId, JobId> = HashMap::new();

    for &start in prerequisites {
        if start == candidate {
            debug!(job_id = %candidate, "self dependency");
            return Some(vec![candidate, candidate]);
        }
        if !visited.insert(start) {
            continue;
        }

        let mut stack: Vec<JobId> = vec![start];

        while let Some(node) = stack.pop() {
            for next in graph.dependencies_of(node) {
                if next == candidate {
                    let path = reconstruct_path(&parent, candidate, node);
                    debug!(job_id = %candidate, hops = path.len() - 1, "dependency cycle found");
                    return Some(path);
                }
                if visited.insert(next) {
                    parent.insert(next, node);
                    stack.push(next);
                }
            }
        }
    }

    None
}

fn reconstruct_path(parent: &HashMap<JobId, JobId>, candidate: JobId, last: JobId) -> Vec<JobId> {
    let mut reversed = vec![last];
    let mut cursor = last;
    while let Some(&p) = parent.get(&cursor) {
        reversed.push(p);
        cursor = p;
    }

    let mut path = Vec::with_capacity(reversed.len() + 2);
    path.push(candidate);
    path.extend(reversed.into_iter().rev());
    path.push(candidate);
    path
}

/// A job is ready when every prerequisite has succeeded.
///
/// `prerequisites` pairs each prerequisite id with its current status, or
/// `None` if the repository no longer knows the job.
pub fn is_ready<I>(job: JobId, prerequisites: I) -> bool
where
    I: IntoIterator<Item = (JobId, Option<JobStatus>)>,
{
    for (dep, status) in prerequisites {
        match status {
            Some(JobStatus::Succeeded) => {}
            Some(_) => return false,
            None => {
                warn!(job_id = %job, dep = %dep, "prerequisite missing from repository");
                return false;
            }
        }
    }
    true
}

/// Prerequisites that ended in a terminal state other than success.
pub fn blocked_by<I>(prerequisites: I) -> Vec<JobId>
where
    I: IntoIterator<Item = (JobId, Option<JobStatus>)>,
{
    prerequisites
        .into_iter()
        .filter_map(|(dep, status)| match status {
            Some(JobStatus::Failed) | Some(JobStatus::Cancelled) => Some(dep),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: usize) -> (DependencyGraph, Vec<JobId>) {
        let ids: Vec<JobId> = (0..len).map(|_| JobId::new()).collect();
        let mut g = DependencyGraph::new();
        g.add_job(ids[0]);
        for w in ids.windows(2) {
            // ids[i+1] depends on ids[i]
            g.add_dependencies(w[1], &[w[0]]);
        }
        (g, ids)
    }

    #[test]
    fn fresh_job_never_closes_a_cycle() {
        let (g, ids) = chain(4);
        let candidate = JobId::new();
        assert_eq!(find_cycle(&g, candidate, &ids), None);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = DependencyGraph::new();
        let a = JobId::new();
        assert_eq!(find_cycle(&g, a, &[a]), Some(vec![a, a]));
    }

    #[test]
    fn closing_a_chain_reports_the_full_path() {
        // 3 -> 2 -> 1 -> 0 ; now ask for 0 -> 3.
        let (g, ids) = chain(4);
        let path = find_cycle(&g, ids[0], &[ids[3]]).expect("cycle");
        assert_eq!(path, vec![ids[0], ids[3], ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let (g, ids) = chain(50_000);
        let last = *ids.last().unwrap();
        let path = find_cycle(&g, ids[0], &[last]).expect("cycle");
        assert_eq!(path.len(), 50_001);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();
        let mut g = DependencyGraph::new();
        g.add_job(a);
        g.add_dependencies(b, &[a]);
        g.add_dependencies(c, &[a]);
        let d = JobId::new();
        assert_eq!(find_cycle(&g, d, &[b, c]), None);
    }

    #[test]
    fn readiness_requires_every_prerequisite_succeeded() {
        let job = JobId::new();
        let a = JobId::new();
        let b = JobId::new();

        assert!(is_ready(job, Vec::new()));
        assert!(is_ready(
            job,
            vec![(a, Some(JobStatus::Succeeded)), (b, Some(JobStatus::Succeeded))]
        ));
        assert!(!is_ready(
            job,
            vec![(a, Some(JobStatus::Succeeded)), (b, Some(JobStatus::Running))]
        ));
        assert!(!is_ready(job, vec![(a, None)]));
    }

    #[test]
    fn blocked_by_lists_failed_and_cancelled() {
        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();
        let blocked = blocked_by(vec![
            (a, Some(JobStatus::Failed)),
            (b, Some(JobStatus::Pending)),
            (c, Some(JobStatus::Cancelled)),
        ]);
        assert_eq!(blocked, vec![a, c]);
    }
}
