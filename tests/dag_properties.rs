// tests/dag_properties.rs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use jobdag::engine::Engine;
use jobdag::errors::{JobdagError, ValidationError};
use jobdag::job::{JobId, RetryPolicy};
use jobdag::retry::backoff_delay;
use jobdag::types::JobStatus;
use jobdag_test_utils::builders::JobSpecBuilder;
use jobdag_test_utils::fake_handlers::RecordingHandler;
use jobdag_test_utils::fast_settings;

// Strategy to generate a random DAG as dependency index lists.
// We ensure acyclicity by only allowing job N to depend on jobs 0..N-1.
fn dag_strategy(max_jobs: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_jobs).prop_flat_map(|num_jobs| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_jobs),
            num_jobs,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, potential)| {
                    let mut deps: Vec<usize> = if i == 0 {
                        Vec::new()
                    } else {
                        potential.into_iter().map(|d| d % i).collect()
                    };
                    deps.sort_unstable();
                    deps.dedup();
                    deps
                })
                .collect()
        })
    })
}

fn submit_dag(engine: &Engine, deps: &[Vec<usize>]) -> Vec<JobId> {
    let mut ids: Vec<JobId> = Vec::with_capacity(deps.len());
    for (i, job_deps) in deps.iter().enumerate() {
        let mut spec = JobSpecBuilder::new("work").named(&i.to_string());
        for d in job_deps {
            spec = spec.after(ids[*d]);
        }
        ids.push(engine.submit(spec.build()).unwrap().id());
    }
    ids
}

/// Whether `from` transitively depends on `target`.
fn depends_on(deps: &[Vec<usize>], from: usize, target: usize) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(n) = stack.pop() {
        if n == target {
            return true;
        }
        if seen.insert(n) {
            stack.extend(deps[n].iter().copied());
        }
    }
    false
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A late edge `a -> b` is rejected exactly when `b` already reaches
    /// `a`, and a rejected edge leaves the graph as it was.
    #[test]
    fn late_edge_rejected_iff_it_closes_a_cycle(
        deps in dag_strategy(12),
        pick in any::<(usize, usize)>(),
    ) {
        let engine = Engine::builder().build();
        let ids = submit_dag(&engine, &deps);
        let a = pick.0 % ids.len();
        let b = pick.1 % ids.len();

        let before = engine.get_status(ids[a]).unwrap().dependencies;
        let result = engine.add_dependencies(ids[a], &[ids[b]]);

        if depends_on(&deps, b, a) {
            match result {
                Err(JobdagError::Validation(ValidationError::CycleDetected { path })) => {
                    prop_assert_eq!(path.first(), Some(&ids[a]));
                    prop_assert_eq!(path.last(), Some(&ids[a]));
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
            prop_assert_eq!(engine.get_status(ids[a]).unwrap().dependencies, before);
        } else {
            prop_assert!(result.is_ok(), "unexpected rejection: {:?}", result);
        }
    }

    /// No job is submitted `ready` while one of its prerequisites is not
    /// `succeeded`.
    #[test]
    fn only_roots_start_ready(deps in dag_strategy(12)) {
        let engine = Engine::builder().build();
        let ids = submit_dag(&engine, &deps);
        for (i, id) in ids.iter().enumerate() {
            let status = engine.get_status(*id).unwrap().status;
            let expected = if deps[i].is_empty() { JobStatus::Ready } else { JobStatus::Pending };
            prop_assert_eq!(status, expected);
        }
    }

    /// Retry delays grow monotonically and never exceed the cap.
    #[test]
    fn backoff_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        extra_ms in 0u64..120_000,
        multiplier in 1.0f64..4.0,
        attempts in 1u32..10,
    ) {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms + extra_ms),
            backoff_multiplier: multiplier,
        };
        prop_assert_eq!(backoff_delay(1, &policy), policy.base_delay);
        let mut prev = Duration::ZERO;
        for k in 1..=attempts {
            let d = backoff_delay(k, &policy);
            prop_assert!(d >= prev);
            prop_assert!(d <= policy.max_delay);
            prev = d;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Every job starts after all of its prerequisites.
    #[test]
    fn execution_respects_dependencies(deps in dag_strategy(10)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let order = rt.block_on(async {
            let handler = RecordingHandler::new();
            let log = handler.log();
            let engine = Engine::builder()
                .handler("work", Arc::new(handler))
                .dispatch(fast_settings(3))
                .build();
            let ids = submit_dag(&engine, &deps);

            let pool = engine.start_workers(3);
            for id in &ids {
                jobdag_test_utils::wait_for_status(&engine, *id, JobStatus::Succeeded).await;
            }
            pool.shutdown().await;
            log.names()
        });

        prop_assert_eq!(order.len(), deps.len());
        let position = |i: usize| order.iter().position(|n| *n == i.to_string()).unwrap();
        for (i, job_deps) in deps.iter().enumerate() {
            for d in job_deps {
                prop_assert!(position(*d) < position(i), "{} ran before its prerequisite {}", i, d);
            }
        }
    }
}
