// packages/pool/tests/properties.rs
//! Randomised operation sequences must keep the pool's books consistent

use proptest::prelude::*;
use sandbox_pool::runtime::{CreateSpec, MemoryRuntime, ResetFault};
use sandbox_pool::{Lease, PoolConfig, PoolError, PoolManager};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Release(usize),
    Drop(usize),
    Crash(usize),
    BreakReset(usize),
    Sweep,
    Reclaim,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Acquire),
        3 => any::<usize>().prop_map(Op::Release),
        1 => any::<usize>().prop_map(Op::Drop),
        1 => any::<usize>().prop_map(Op::Crash),
        1 => any::<usize>().prop_map(Op::BreakReset),
        1 => Just(Op::Sweep),
        1 => Just(Op::Reclaim),
    ]
}

fn pick<T>(items: &[T], index: usize) -> Option<usize> {
    if items.is_empty() {
        None
    } else {
        Some(index % items.len())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_random_operations_keep_invariants(
        initial in 0usize..=3,
        ops in prop::collection::vec(op(), 1..30),
    ) {
        let max_size = 3;
        let config = PoolConfig {
            initial_size: initial,
            min_size: 1,
            max_size,
            idle_timeout_ms: 1,
            max_consecutive_quick_failures: 2,
            shutdown_drain_ms: 50,
            background_join_grace_ms: 500,
            ..Default::default()
        };
        let runtime = MemoryRuntime::new();
        let pool = PoolManager::start(config, Arc::new(runtime.clone()), CreateSpec::default())
            .unwrap();
        let mut held: Vec<Lease> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire => match pool.acquire(Duration::from_millis(10)) {
                    Ok(lease) => held.push(lease),
                    Err(PoolError::PoolExhausted { .. }) => {
                        prop_assert!(held.len() == max_size || runtime.live_containers() >= max_size);
                    }
                    Err(e) => prop_assert!(false, "unexpected acquire error: {}", e),
                },
                Op::Release(i) => {
                    if let Some(i) = pick(&held, i) {
                        pool.release(held.swap_remove(i));
                    }
                }
                Op::Drop(i) => {
                    if let Some(i) = pick(&held, i) {
                        drop(held.swap_remove(i));
                    }
                }
                Op::Crash(i) => {
                    let ids = runtime.container_ids();
                    if let Some(i) = pick(&ids, i) {
                        if let Some(container) = runtime.container(&ids[i]) {
                            container.crash();
                        }
                    }
                }
                Op::BreakReset(i) => {
                    if let Some(i) = pick(&held, i) {
                        if let Some(container) = runtime.container(held[i].id()) {
                            container.set_reset_fault(Some(ResetFault::ExitNonZero));
                        }
                    }
                }
                Op::Sweep => {
                    pool.run_health_sweep();
                }
                Op::Reclaim => {
                    pool.run_idle_reclamation();
                }
            }

            let stats = pool.stats();
            prop_assert!(pool.verify_invariants().is_ok(), "{:?}", pool.verify_invariants());
            prop_assert!(stats.total_count <= max_size);
            prop_assert_eq!(stats.in_use_count, held.len());
            prop_assert_eq!(
                stats.total_created - stats.total_destroyed,
                stats.total_count as u64
            );
            prop_assert_eq!(runtime.live_containers(), stats.total_count);
        }

        for lease in held.drain(..) {
            pool.release(lease);
        }
        prop_assert_eq!(pool.stats().in_use_count, 0);

        pool.shutdown();
        prop_assert_eq!(runtime.live_containers(), 0);
    }
}
