// packages/pool/src/main.rs
//! Sandbox Pool
//!
//! Starts a Docker-backed pool, runs every command-line argument as a
//! program through the executor, prints the outcomes and the final pool
//! statistics as JSON, then shuts the pool down.
//!
//! ```text
//! sandbox-pool 'print(1 + 1)' 'import sys; sys.exit(3)'
//! ```

use anyhow::{Context, Result};
use sandbox_pool::observability::init_tracing;
use sandbox_pool::{BuildInfo, DockerRuntime, EngineConfig, PoolManager, SandboxExecutor};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;
    init_tracing(&config.logging.level, config.logging.json);

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        "Starting sandbox pool"
    );

    let sources: Vec<String> = std::env::args().skip(1).collect();
    if sources.is_empty() {
        anyhow::bail!("usage: sandbox-pool <program source>...");
    }

    let runtime = DockerRuntime::new(
        &config.runtime.docker_binary,
        config.runtime.create_timeout(),
        config.runtime.call_timeout(),
    )
    .context("container runtime unavailable")?;

    let pool = Arc::new(
        PoolManager::start(
            config.pool.clone(),
            Arc::new(runtime),
            config.runtime.create_spec(),
        )
        .context("failed to start pool")?,
    );
    let executor = SandboxExecutor::new(Arc::clone(&pool), config.executor.clone());

    let mut failures = 0;
    for (index, source) in sources.iter().enumerate() {
        let report = match executor.execute(source) {
            Ok(outcome) => json!({ "program": index, "outcome": outcome }),
            Err(e) => {
                failures += 1;
                error!(program = index, error = %e, "Execution failed");
                json!({ "program": index, "error": e.to_string(), "retryable": e.is_retryable() })
            }
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    pool.shutdown();
    println!("{}", serde_json::to_string_pretty(&pool.stats())?);

    if failures > 0 {
        anyhow::bail!("{} of {} programs could not be executed", failures, sources.len());
    }
    Ok(())
}
