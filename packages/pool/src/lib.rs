// packages/pool/src/lib.rs
//! Sandbox Pool Library
//!
//! A concurrency-safe pool of pre-warmed, isolated execution environments
//! for running untrusted programs with bounded resources and near-zero
//! per-request startup latency.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **runtime**: Container runtime capability traits and adapters (Docker CLI, in-memory)
//! - **pool**: Leasing, reset, health checks, background reconciliation, shutdown
//! - **executor**: Run one program per lease with output limits
//! - **observability**: Tracing setup and metrics
//! - **utils**: Configuration loading and error types
//!
//! # Example
//!
//! ```no_run
//! use sandbox_pool::{DockerRuntime, EngineConfig, PoolManager};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> sandbox_pool::Result<()> {
//! let config = EngineConfig::load()?;
//! let runtime = DockerRuntime::new(
//!     &config.runtime.docker_binary,
//!     config.runtime.create_timeout(),
//!     config.runtime.call_timeout(),
//! )?;
//! let pool = PoolManager::start(config.pool, Arc::new(runtime), config.runtime.create_spec())?;
//!
//! let lease = pool.acquire(Duration::from_secs(5))?;
//! let output = lease.run(&["echo".to_string(), "hi".to_string()], Duration::from_secs(1))?;
//! pool.release(lease);
//! println!("{}", output.stdout);
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod executor;
pub mod observability;
pub mod pool;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use executor::{ExecutionOutcome, SandboxExecutor};
pub use pool::{Lease, PoolConfig, PoolManager, PoolStats};
pub use runtime::{ContainerRuntime, CreateSpec, DockerRuntime, EnvironmentHandle, MemoryRuntime};
pub use utils::config::EngineConfig;
pub use utils::errors::{PoolError, Result, RuntimeError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
