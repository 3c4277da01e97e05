// packages/pool/tests/docker.rs
//! Smoke tests against a real Docker daemon
//!
//! Ignored by default. Run with `cargo test --test docker -- --ignored`
//! on a host where `docker` works and `python:3.11-slim` can be pulled.

use sandbox_pool::utils::config::{ExecutorConfig, RuntimeConfig};
use sandbox_pool::{DockerRuntime, PoolConfig, PoolManager, SandboxExecutor};
use std::sync::Arc;
use std::time::Duration;

fn docker_pool(size: usize) -> Arc<PoolManager> {
    let runtime_config = RuntimeConfig::default();
    let runtime = DockerRuntime::new(
        &runtime_config.docker_binary,
        runtime_config.create_timeout(),
        runtime_config.call_timeout(),
    )
    .expect("docker binary on PATH");

    let config = PoolConfig {
        shutdown_drain_ms: 1_000,
        ..PoolConfig::fixed(size)
    };
    Arc::new(
        PoolManager::start(config, Arc::new(runtime), runtime_config.create_spec())
            .expect("pool should start"),
    )
}

#[test]
#[ignore = "requires a Docker daemon"]
fn test_docker_execute_and_reuse() {
    let pool = docker_pool(1);
    let executor = SandboxExecutor::new(Arc::clone(&pool), ExecutorConfig::default());

    let first = executor
        .execute("open('/tmp/leftover', 'w').write('x'); print(40 + 2)")
        .unwrap();
    assert_eq!(first.exit_code, 0);
    assert_eq!(first.stdout.trim(), "42");

    let second = executor
        .execute("import os; print(os.path.exists('/tmp/leftover'))")
        .unwrap();
    assert_eq!(second.stdout.trim(), "False");

    let stats = pool.stats();
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_resets, 2);
    pool.shutdown();
}

#[test]
#[ignore = "requires a Docker daemon"]
fn test_docker_isolation() {
    let pool = docker_pool(1);
    let executor = SandboxExecutor::new(Arc::clone(&pool), ExecutorConfig::default());

    let outcome = executor
        .execute("import urllib.request; urllib.request.urlopen('http://example.com', timeout=3)")
        .unwrap();
    assert_ne!(outcome.exit_code, 0);

    let outcome = executor.execute("open('/etc/marker', 'w')").unwrap();
    assert_ne!(outcome.exit_code, 0);
    pool.shutdown();
}

#[test]
#[ignore = "requires a Docker daemon"]
fn test_docker_health_sweep_and_shutdown() {
    let pool = docker_pool(2);
    let report = pool.run_health_sweep();
    assert_eq!(report.checked, 2);
    assert_eq!(report.failed, 0);

    let lease = pool.acquire(Duration::from_secs(30)).unwrap();
    pool.release(lease);
    assert!(pool.verify_invariants().is_ok());

    pool.shutdown();
    assert_eq!(pool.stats().total_count, 0);
}
